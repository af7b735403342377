//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry, token authority and connection admission from the configuration,
//! serves the HTTP/WebSocket surface and runs the idle sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::TokenAuthority;
use crate::config::Config;
use crate::connection::ConnectionAdmission;
use crate::server::{self, AppState, HeartbeatConfig};
use crate::session::{PtySessionRegistry, SessionRegistry};

/// How long `stop` waits for the listener task to wind down.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The listener is bound.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Owner of every running shell.
    registry: Arc<PtySessionRegistry>,
    /// Issues and verifies access tokens.
    authority: Arc<TokenAuthority>,
    /// Connection ceiling.
    admission: Arc<ConnectionAdmission>,
    /// Address the listener is bound to while running.
    local_addr: Option<SocketAddr>,
    /// HTTP server task.
    server_task: Option<JoinHandle<()>>,
    /// Idle sweep task.
    sweep_task: Option<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let authority = TokenAuthority::from_config(&config.auth)
            .context("Failed to initialize token authority")?;
        info!(users = authority.user_count(), "Token authority ready");

        let registry = PtySessionRegistry::new(config.session.defaults());
        let admission = ConnectionAdmission::new(config.server.max_connections);

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry: Arc::new(registry),
            authority: Arc::new(authority),
            admission,
            local_addr: None,
            server_task: None,
            sweep_task: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let listener = match TcpListener::bind(&self.config.server.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped).await;
                return Err(e).with_context(|| {
                    format!("Failed to bind to {}", self.config.server.bind_addr)
                });
            }
        };
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(addr);

        self.shutdown_token = CancellationToken::new();

        let heartbeat = HeartbeatConfig {
            interval: self.config.server.heartbeat_interval(),
            timeout: self.config.server.heartbeat_timeout(),
        };
        let state = Arc::new(AppState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.authority),
            Arc::clone(&self.admission),
            heartbeat,
            self.shutdown_token.clone(),
        ));
        let app = server::router(state);

        let shutdown = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.server_task = Some(tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;

            match result {
                Ok(()) => debug!("HTTP server stopped"),
                Err(e) => {
                    error!("HTTP server error: {}", e);
                    let _ = event_tx.send(OrchestratorEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        }));
        info!("Listening on http://{}", addr);
        self.emit_event(OrchestratorEvent::Listening { addr });

        self.sweep_task = Some(self.registry.start_idle_sweep(
            self.config.session.sweep_interval(),
            self.config.session.idle_timeout(),
            self.shutdown_token.child_token(),
        ));
        debug!("Started idle session sweep");

        self.set_state(OrchestratorState::Running).await;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Stops accepting connections, ends every open WebSocket and terminates
    /// every session. A no-op when already stopped.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(task) = self.server_task.take() {
            if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("HTTP server did not stop in time");
            }
        }
        if let Some(task) = self.sweep_task.take() {
            let _ = task.await;
        }

        self.registry.close_all().await;
        self.local_addr = None;

        self.set_state(OrchestratorState::Stopped).await;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    async fn set_state(&self, next: OrchestratorState) {
        *self.state.write().await = next;
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<PtySessionRegistry> {
        &self.registry
    }

    /// Returns the token authority.
    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    /// Returns the number of admitted connections.
    pub fn connection_count(&self) -> usize {
        self.admission.active()
    }

    /// Returns the number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
