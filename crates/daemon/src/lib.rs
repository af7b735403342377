//! # WebTerm Daemon Library
//!
//! This crate provides the server side of WebTerm: interactive shell sessions
//! on the host, driven by browsers over a JSON WebSocket protocol.
//!
//! ## Overview
//!
//! - **Session Registry**: Spawns shells on pseudo-terminals, indexes them by
//!   id and owner, streams their output and terminates them
//! - **Connection Protocol**: Per-connection authentication, session binding
//!   and message dispatch
//! - **Admission**: A hard ceiling on concurrent WebSocket connections
//! - **Auth**: Configured users, password login and signed bearer tokens
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │   HTTP: /health  /api/auth/login  /api/sessions           │  │
//! │  │   WS:   /terminal ──► Admission ──► ConnectionProtocol    │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌──────────────┐  ┌────────────────────────────────────────┐   │
//! │  │    Token     │  │          Session Registry              │   │
//! │  │  Authority   │  │  ProcessSession ─► OutputHub ─► subs   │   │
//! │  └──────────────┘  └────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until told to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, output fan-out and the registry
//! - [`connection`]: Admission control and the per-connection protocol
//! - [`auth`]: Users and tokens
//! - [`server`]: HTTP and WebSocket handlers
//! - [`logging`]: Tracing subscriber setup
//! - [`orchestrator`]: Main daemon coordinator

pub mod auth;
pub mod config;
pub mod connection;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export auth types for convenience
pub use auth::{AuthError, Identity, IssuedToken, TokenAuthority, TokenVerifier};

// Re-export session types for convenience
pub use session::{
    PtySessionRegistry, SessionDefaults, SessionError, SessionId, SessionOptions,
    SessionRegistry, SessionSummary,
};

// Re-export connection types for convenience
pub use connection::{AdmissionError, ConnectionAdmission, ConnectionError, ConnectionProtocol};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
