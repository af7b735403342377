//! Error types for the protocol crate.

use thiserror::Error;

use crate::messages::ErrorCode;

/// Protocol error type covering every way an inbound frame can be rejected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object of the expected envelope shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The envelope carried a `type` that is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The envelope is well formed but its `data` does not match the variant.
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload {
        /// Message type whose payload was rejected.
        kind: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Failed to serialize an outbound message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Wire error code reported to the peer for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownType(_) => ErrorCode::InvalidMessageType,
            ProtocolError::Malformed(_) | ProtocolError::InvalidPayload { .. } => {
                ErrorCode::InvalidMessage
            }
            ProtocolError::Serialization(_) => ErrorCode::InternalError,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Malformed(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
