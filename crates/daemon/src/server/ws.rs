//! The `/terminal` WebSocket endpoint.
//!
//! Each socket is driven by one task that multiplexes inbound frames, the
//! bound session's output and the heartbeat ticker. Outbound frames go
//! through a bounded queue to a separate writer task, so a stalled client
//! never blocks the heartbeat: the connection is dropped when the queue
//! overflows or a single send outlasts the heartbeat timeout.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use protocol::{ErrorCode, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{ApiError, AppState};
use crate::auth::TokenAuthority;
use crate::connection::{AdmissionGuard, ConnectionProtocol};
use crate::session::PtySessionRegistry;

/// Frames a connection may have queued for its writer before it is dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

type Protocol = ConnectionProtocol<PtySessionRegistry, TokenAuthority>;

/// Upgrade handler. Refuses with 503 when the connection ceiling is reached.
pub async fn terminal(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);

    let guard = state.admission.try_admit(peer).map_err(|e| {
        warn!(peer = ?peer, error = %e, "Rejected WebSocket connection");
        ApiError::from(e)
    })?;

    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, guard)))
}

enum Step {
    Inbound(Option<Result<Message, axum::Error>>),
    Event(ServerMessage),
    Tick,
    WriterGone,
    Shutdown,
}

/// Why the outbound queue refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejected {
    Overflow,
    WriterGone,
}

/// Producer side of a connection's bounded outbound queue.
struct Outbound {
    connection_id: String,
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    fn push(&self, message: Message) -> Result<(), Rejected> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    capacity = OUTBOUND_QUEUE_CAPACITY,
                    "Outbound queue full, dropping connection"
                );
                Err(Rejected::Overflow)
            }
            Err(TrySendError::Closed(_)) => Err(Rejected::WriterGone),
        }
    }

    fn push_all(&self, messages: &[ServerMessage]) -> Result<(), Rejected> {
        for message in messages {
            match message.to_json() {
                Ok(json) => self.push(Message::Text(json))?,
                Err(e) => warn!(kind = message.kind(), error = %e, "Failed to encode message"),
            }
        }
        Ok(())
    }
}

async fn run_connection(socket: WebSocket, state: Arc<AppState>, guard: AdmissionGuard) {
    let connection_id = guard.id().to_string();
    info!(
        connection_id = %connection_id,
        peer = ?guard.info().peer_addr,
        "WebSocket connected"
    );

    let heartbeat = state.heartbeat;
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let outbound = Outbound {
        connection_id: connection_id.clone(),
        tx,
    };
    let mut writer = tokio::spawn(write_outbound(
        connection_id.clone(),
        sender,
        rx,
        heartbeat.timeout,
    ));
    let mut writer_done = false;

    let mut protocol: Protocol = ConnectionProtocol::new(
        connection_id.clone(),
        Arc::clone(&state.registry),
        Arc::clone(&state.authority),
    );

    let mut ticker = tokio::time::interval(heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        let step = tokio::select! {
            inbound = receiver.next() => Step::Inbound(inbound),
            event = protocol.next_event() => Step::Event(event),
            _ = ticker.tick() => Step::Tick,
            _ = &mut writer, if !writer_done => Step::WriterGone,
            _ = state.shutdown.cancelled() => Step::Shutdown,
        };

        match step {
            Step::Inbound(None) => {
                debug!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
            Step::Inbound(Some(Err(e))) => {
                warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
            Step::Inbound(Some(Ok(message))) => {
                last_seen = Instant::now();
                let replies = match message {
                    Message::Text(text) => protocol.handle_text(&text).await,
                    Message::Binary(data) => match String::from_utf8(data) {
                        Ok(text) => protocol.handle_text(&text).await,
                        Err(_) => vec![ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "frames must be UTF-8 JSON",
                        )],
                    },
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(frame) => {
                        debug!(connection_id = %connection_id, ?frame, "Client sent close frame");
                        break;
                    }
                };
                if outbound.push_all(&replies).is_err() {
                    break;
                }
            }
            Step::Event(message) => {
                if outbound.push_all(std::slice::from_ref(&message)).is_err() {
                    break;
                }
            }
            Step::Tick => {
                if last_seen.elapsed() > heartbeat.timeout {
                    warn!(
                        connection_id = %connection_id,
                        silent_secs = last_seen.elapsed().as_secs(),
                        "Heartbeat timeout, dropping connection"
                    );
                    break;
                }
                if outbound.push(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            Step::WriterGone => {
                writer_done = true;
                debug!(connection_id = %connection_id, "WebSocket writer stopped");
                break;
            }
            Step::Shutdown => {
                debug!(connection_id = %connection_id, "Daemon stopping, closing WebSocket");
                break;
            }
        }
    }

    protocol.shutdown();

    // Closing the queue lets the writer flush what is left and send a close
    // frame; a stalled writer is abandoned after the heartbeat timeout.
    drop(outbound);
    if !writer_done && tokio::time::timeout(heartbeat.timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    drop(guard);
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Drains the outbound queue into the socket.
///
/// Returns when the queue closes, a send fails, or a single send does not
/// complete within `send_timeout`.
async fn write_outbound<S>(
    connection_id: String,
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    send_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(message) = rx.recv().await {
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
                return;
            }
            Err(_) => {
                warn!(
                    connection_id = %connection_id,
                    timeout_secs = send_timeout.as_secs_f64(),
                    "WebSocket send stalled, dropping connection"
                );
                return;
            }
        }
    }

    let _ = tokio::time::timeout(send_timeout, sink.close()).await;
}
