//! Protocol message definitions for WebTerm.
//!
//! Every frame on the wire is a JSON text message shaped as
//! `{type, sessionId?, data, timestamp}`. Inbound frames are parsed in two
//! steps: first the envelope ([`Frame`]), then the `type` selects a closed
//! [`ClientMessage`] variant whose `data` must match that variant's shape.
//! Outbound messages are built as [`ServerMessage`] values and rendered to a
//! [`Frame`] with the send timestamp.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Current protocol version, reported by the health endpoint.
pub const PROTOCOL_VERSION: u8 = 1;

/// Wire names of every message type.
pub mod kind {
    pub const AUTH: &str = "auth";
    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const COMMAND: &str = "command";
    pub const CONTROL_RESIZE: &str = "control.resize";
    pub const CONTROL_SIGNAL: &str = "control.signal";
    pub const PING: &str = "ping";

    pub const AUTH_SUCCESS: &str = "auth:success";
    pub const AUTH_FAILURE: &str = "auth:failure";
    pub const SESSION_CREATED: &str = "session:created";
    pub const SESSION_CLOSED: &str = "session:closed";
    pub const SESSION_EXIT: &str = "session:exit";
    pub const OUTPUT: &str = "output";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}

/// Current time as Unix milliseconds.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Envelope
// ============================================================================

/// The JSON envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Message type, e.g. `session.create` or `output`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Session the message refers to, when it refers to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Send time in Unix milliseconds. Inbound timestamps that are not
    /// numbers (some clients send ISO strings) are accepted and dropped.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<u64>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_u64()))
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(kind: impl Into<String>, session_id: Option<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            session_id,
            data,
            timestamp: Some(timestamp_now()),
        }
    }

    /// Parse a text frame into an envelope.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::Malformed(
                "frame must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Render the frame as JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn to_data<T: Serialize>(value: &T) -> Value {
    // Payload structs contain only strings, integers and options.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ============================================================================
// Client -> server
// ============================================================================

/// Authenticate the connection with a bearer token.
///
/// A missing token parses as empty and is refused by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthRequest {
    pub token: String,
}

/// Spawn a new shell and bind it to the connection. Every field is optional;
/// the daemon fills in its configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// Change the terminal geometry of the bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Deliver a signal (`SIGINT`, `INT`, ...) to the bound session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: String,
}

/// Every message a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    SessionCreate(SessionCreateRequest),
    SessionClose,
    /// Raw terminal input, written to the pty unmodified.
    Command(String),
    Resize(ResizeRequest),
    Signal(SignalRequest),
    Ping,
}

impl ClientMessage {
    /// Parse and validate one inbound text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_frame(Frame::parse(text)?)
    }

    /// Validate an already parsed envelope.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let Frame { kind: k, data, .. } = frame;
        match k.as_str() {
            kind::AUTH => {
                if data.is_null() {
                    Ok(ClientMessage::Auth(AuthRequest::default()))
                } else {
                    Ok(ClientMessage::Auth(payload(&k, data)?))
                }
            }
            kind::SESSION_CREATE => {
                if data.is_null() {
                    Ok(ClientMessage::SessionCreate(SessionCreateRequest::default()))
                } else {
                    Ok(ClientMessage::SessionCreate(payload(&k, data)?))
                }
            }
            kind::SESSION_CLOSE => Ok(ClientMessage::SessionClose),
            kind::COMMAND => command_input(&k, data).map(ClientMessage::Command),
            kind::CONTROL_RESIZE => Ok(ClientMessage::Resize(payload(&k, data)?)),
            kind::CONTROL_SIGNAL => Ok(ClientMessage::Signal(payload(&k, data)?)),
            kind::PING => Ok(ClientMessage::Ping),
            _ => Err(ProtocolError::UnknownType(k.clone())),
        }
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth(_) => kind::AUTH,
            ClientMessage::SessionCreate(_) => kind::SESSION_CREATE,
            ClientMessage::SessionClose => kind::SESSION_CLOSE,
            ClientMessage::Command(_) => kind::COMMAND,
            ClientMessage::Resize(_) => kind::CONTROL_RESIZE,
            ClientMessage::Signal(_) => kind::CONTROL_SIGNAL,
            ClientMessage::Ping => kind::PING,
        }
    }

    /// Build the envelope a client sends for this message.
    pub fn to_frame(&self) -> Frame {
        let data = match self {
            ClientMessage::Auth(req) => to_data(req),
            ClientMessage::SessionCreate(req) => to_data(req),
            ClientMessage::Command(input) => Value::String(input.clone()),
            ClientMessage::Resize(req) => to_data(req),
            ClientMessage::Signal(req) => to_data(req),
            ClientMessage::SessionClose | ClientMessage::Ping => Value::Object(Default::default()),
        };
        Frame::new(self.kind(), None, data)
    }
}

/// Terminal input arrives as a bare string, `{command, encoding?}` or
/// `{data}`. Only UTF-8 text is accepted as an encoding.
fn command_input(k: &str, data: Value) -> Result<String> {
    let invalid = |reason: String| ProtocolError::InvalidPayload {
        kind: k.to_string(),
        reason,
    };

    let mut fields = match data {
        Value::String(input) => return Ok(input),
        Value::Object(fields) => fields,
        other => {
            return Err(invalid(format!(
                "expected a string or object, got {}",
                json_type(&other)
            )))
        }
    };

    if let Some(encoding) = fields.get("encoding") {
        match encoding.as_str() {
            None => {}
            Some(enc) if enc.eq_ignore_ascii_case("utf8") || enc.eq_ignore_ascii_case("utf-8") => {}
            Some(enc) => return Err(invalid(format!("unsupported encoding `{enc}`"))),
        }
    }

    match fields.remove("command").or_else(|| fields.remove("data")) {
        Some(Value::String(input)) => Ok(input),
        Some(other) => Err(invalid(format!(
            "expected command text to be a string, got {}",
            json_type(&other)
        ))),
        None => Err(invalid("missing `command` field".to_string())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Identity echoed back after successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccess {
    pub user: UserInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosed {
    pub session_id: String,
}

/// The bound session's process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExit {
    pub session_id: String,
    pub exit_code: i32,
    /// Signal the daemon used to end the process, if it did.
    pub signal: Option<String>,
}

/// One chunk of raw terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub session_id: String,
    pub bytes: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct OutputData {
    bytes: String,
}

/// Error codes reported in `error` and `auth:failure` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    AuthFailed,
    SessionRequired,
    SessionNotFound,
    SessionInactive,
    SpawnError,
    SessionLimit,
    InvalidSignal,
    InvalidGeometry,
    InvalidMessage,
    InvalidMessageType,
    ConnectionCapacityExceeded,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::SessionRequired => "SESSION_REQUIRED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionInactive => "SESSION_INACTIVE",
            ErrorCode::SpawnError => "SPAWN_ERROR",
            ErrorCode::SessionLimit => "SESSION_LIMIT",
            ErrorCode::InvalidSignal => "INVALID_SIGNAL",
            ErrorCode::InvalidGeometry => "INVALID_GEOMETRY",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            ErrorCode::ConnectionCapacityExceeded => "CONNECTION_CAPACITY_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `error` and `auth:failure` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: u64,
}

/// Every message the daemon may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    AuthSuccess(AuthSuccess),
    AuthFailure(ErrorPayload),
    SessionCreated(SessionCreated),
    SessionClosed(SessionClosed),
    SessionExit(SessionExit),
    Output(Output),
    Error(ErrorPayload),
    Pong(Pong),
}

impl ServerMessage {
    /// Shorthand for an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload::new(code, message))
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthSuccess(_) => kind::AUTH_SUCCESS,
            ServerMessage::AuthFailure(_) => kind::AUTH_FAILURE,
            ServerMessage::SessionCreated(_) => kind::SESSION_CREATED,
            ServerMessage::SessionClosed(_) => kind::SESSION_CLOSED,
            ServerMessage::SessionExit(_) => kind::SESSION_EXIT,
            ServerMessage::Output(_) => kind::OUTPUT,
            ServerMessage::Error(_) => kind::ERROR,
            ServerMessage::Pong(_) => kind::PONG,
        }
    }

    /// Session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated(m) => Some(&m.session_id),
            ServerMessage::SessionClosed(m) => Some(&m.session_id),
            ServerMessage::SessionExit(m) => Some(&m.session_id),
            ServerMessage::Output(m) => Some(&m.session_id),
            _ => None,
        }
    }

    /// Render as an envelope stamped with the current time.
    pub fn to_frame(&self) -> Frame {
        let data = match self {
            ServerMessage::AuthSuccess(m) => to_data(m),
            ServerMessage::AuthFailure(m) | ServerMessage::Error(m) => to_data(m),
            ServerMessage::SessionCreated(m) => to_data(m),
            ServerMessage::SessionClosed(m) => to_data(m),
            ServerMessage::SessionExit(m) => to_data(m),
            ServerMessage::Output(m) => to_data(&OutputData {
                bytes: BASE64.encode(&m.bytes),
            }),
            ServerMessage::Pong(m) => to_data(m),
        };
        Frame::new(self.kind(), self.session_id().map(str::to_string), data)
    }

    /// Render as JSON text ready for the socket.
    pub fn to_json(&self) -> Result<String> {
        self.to_frame().to_json()
    }

    /// Decode a server frame. Used by clients and tests.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let Frame {
            kind: k,
            session_id,
            data,
            ..
        } = frame;
        match k.as_str() {
            kind::AUTH_SUCCESS => Ok(ServerMessage::AuthSuccess(payload(&k, data)?)),
            kind::AUTH_FAILURE => Ok(ServerMessage::AuthFailure(payload(&k, data)?)),
            kind::SESSION_CREATED => Ok(ServerMessage::SessionCreated(payload(&k, data)?)),
            kind::SESSION_CLOSED => Ok(ServerMessage::SessionClosed(payload(&k, data)?)),
            kind::SESSION_EXIT => Ok(ServerMessage::SessionExit(payload(&k, data)?)),
            kind::OUTPUT => {
                let body: OutputData = payload(&k, data)?;
                let bytes =
                    BASE64
                        .decode(body.bytes)
                        .map_err(|e| ProtocolError::InvalidPayload {
                            kind: k.clone(),
                            reason: e.to_string(),
                        })?;
                Ok(ServerMessage::Output(Output {
                    session_id: session_id.unwrap_or_default(),
                    bytes,
                }))
            }
            kind::ERROR => Ok(ServerMessage::Error(payload(&k, data)?)),
            kind::PONG => Ok(ServerMessage::Pong(payload(&k, data)?)),
            _ => Err(ProtocolError::UnknownType(k.clone())),
        }
    }

    /// Parse JSON text produced by [`ServerMessage::to_json`].
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_frame(Frame::parse(text)?)
    }
}
