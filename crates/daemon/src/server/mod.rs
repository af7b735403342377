//! HTTP and WebSocket surface.
//!
//! ```text
//! GET    /health              liveness and counters
//! POST   /api/auth/login      exchange credentials for a token
//! GET    /api/sessions        caller's sessions (Bearer)
//! DELETE /api/sessions/:id    close one of the caller's sessions (Bearer)
//! GET    /terminal            WebSocket upgrade, gated by admission
//! ```

pub mod http;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::auth::TokenAuthority;
use crate::connection::ConnectionAdmission;
use crate::session::PtySessionRegistry;

pub use http::ApiError;

/// Connection liveness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between server pings.
    pub interval: Duration,
    /// Silence after which a connection is dropped.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Shared state handed to every handler.
pub struct AppState {
    pub registry: Arc<PtySessionRegistry>,
    pub authority: Arc<TokenAuthority>,
    pub admission: Arc<ConnectionAdmission>,
    pub heartbeat: HeartbeatConfig,
    /// Cancelled when the daemon stops; open WebSockets end on it.
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<PtySessionRegistry>,
        authority: Arc<TokenAuthority>,
        admission: Arc<ConnectionAdmission>,
        heartbeat: HeartbeatConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            authority,
            admission,
            heartbeat,
            shutdown,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/api/auth/login", post(http::login))
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/:session_id", delete(http::delete_session))
        .route("/terminal", get(ws::terminal))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
