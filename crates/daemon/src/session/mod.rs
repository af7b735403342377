//! Session management module.
//!
//! This module provides PTY spawning, output fan-out and the session
//! registry that owns every running shell.

pub mod output;
pub mod pty;
pub mod registry;

use thiserror::Error;

pub use output::{ExitInfo, OutputHub, SessionEvent, SessionSubscription};
pub use pty::{ProcessSession, SpawnOptions};
pub use registry::{
    CreatedSession, ExitDisposition, PtySessionRegistry, SessionDefaults, SessionOptions,
    SessionRegistry, SessionSummary,
};

/// Unique identifier for a session.
pub type SessionId = String;

/// Identity id of the user that owns a session.
pub type OwnerId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has exited or is being terminated.
    #[error("session is not active: {0}")]
    Inactive(SessionId),

    /// Failed to spawn the PTY or the shell.
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    /// The configured session ceiling was reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// The signal name is not recognised.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// Terminal dimensions must be non-zero.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to deliver a signal.
    #[error("failed to signal session: {0}")]
    SignalFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
