//! # WebTerm Protocol Library
//!
//! Wire definitions for the WebTerm remote terminal daemon.
//!
//! ## Overview
//!
//! Clients talk to the daemon over a WebSocket carrying JSON text frames:
//!
//! ```text
//! {"type": "session.create", "sessionId": null, "data": {...}, "timestamp": 1700000000000}
//! ```
//!
//! - **Envelope**: [`Frame`], the `{type, sessionId?, data, timestamp}` shape
//! - **Client messages**: [`ClientMessage`], a closed set validated at the boundary
//! - **Server messages**: [`ServerMessage`], including raw output as base64
//! - **Error codes**: [`ErrorCode`], reported in `error` and `auth:failure`
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ErrorCode, ServerMessage};
//!
//! let msg = ClientMessage::parse(r#"{"type":"command","data":"ls\n"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::Command("ls\n".to_string()));
//!
//! let reply = ServerMessage::error(ErrorCode::SessionRequired, "No active session");
//! let json = reply.to_json().unwrap();
//! assert!(json.contains("SESSION_REQUIRED"));
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    kind, timestamp_now, AuthRequest, AuthSuccess, ClientMessage, ErrorCode, ErrorPayload, Frame,
    Output, Pong, ResizeRequest, ServerMessage, SessionClosed, SessionCreateRequest,
    SessionCreated, SessionExit, SignalRequest, UserInfo, PROTOCOL_VERSION,
};
