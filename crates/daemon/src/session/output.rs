//! Session output fan-out.
//!
//! Each session owns one [`OutputHub`]. The pty reader publishes raw chunks
//! into it and the waiter publishes the final exit event. Connections consume
//! them through a [`SessionSubscription`], which unregisters itself when
//! dropped. Subscriber queues are unbounded so the reader never waits on a
//! slow socket; each connection bounds its own outbound queue and drops
//! itself when that queue overflows.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::SessionId;

/// Output kept for a session nobody has subscribed to yet.
const BACKLOG_LIMIT_BYTES: usize = 256 * 1024;

/// How a session's process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i32,
    /// Signal the daemon delivered to end the process, if any.
    pub signal: Option<String>,
}

/// One item in a session's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    /// Always the last event of a stream.
    Exit(ExitInfo),
}

type SubscriberId = u64;

struct HubState {
    subscribers: HashMap<SubscriberId, mpsc::UnboundedSender<SessionEvent>>,
    /// Present until the first subscriber attaches.
    backlog: Option<VecDeque<Bytes>>,
    backlog_bytes: usize,
    exit: Option<ExitInfo>,
    next_id: SubscriberId,
}

/// Per-session fan-out of output chunks and the exit event.
pub struct OutputHub {
    session_id: SessionId,
    state: Mutex<HubState>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

impl OutputHub {
    pub fn new(session_id: SessionId) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            session_id,
            state: Mutex::new(HubState {
                subscribers: HashMap::new(),
                backlog: Some(VecDeque::new()),
                backlog_bytes: 0,
                exit: None,
                next_id: 0,
            }),
            exit_tx,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Delivers a chunk to every subscriber, in call order.
    ///
    /// Chunks published after [`OutputHub::finish`] are discarded.
    pub fn publish(&self, chunk: Bytes) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.exit.is_some() {
            return;
        }

        if let Some(backlog) = state.backlog.as_mut() {
            state.backlog_bytes += chunk.len();
            backlog.push_back(chunk);
            while state.backlog_bytes > BACKLOG_LIMIT_BYTES {
                let Some(dropped) = backlog.pop_front() else {
                    break;
                };
                state.backlog_bytes -= dropped.len();
            }
            return;
        }

        state
            .subscribers
            .retain(|_, tx| tx.send(SessionEvent::Output(chunk.clone())).is_ok());
    }

    /// Publishes the exit event and closes every subscriber stream.
    ///
    /// Only the first call has any effect.
    pub fn finish(&self, exit: ExitInfo) {
        let mut state = self.state.lock();
        if state.exit.is_some() {
            return;
        }
        state.exit = Some(exit.clone());
        for (_, tx) in state.subscribers.drain() {
            let _ = tx.send(SessionEvent::Exit(exit.clone()));
        }
        drop(state);

        tracing::debug!(
            session_id = %self.session_id,
            exit_code = exit.exit_code,
            "Published session exit"
        );
        self.exit_tx.send_replace(Some(exit));
    }

    /// Opens a new subscription.
    ///
    /// The first subscriber receives any output produced before it attached.
    /// Subscribing after the process exited yields just the exit event.
    pub fn subscribe(self: &Arc<Self>) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        if let Some(backlog) = state.backlog.take() {
            for chunk in backlog {
                let _ = tx.send(SessionEvent::Output(chunk));
            }
            state.backlog_bytes = 0;
        }

        let id = state.next_id;
        state.next_id += 1;

        match state.exit.clone() {
            Some(exit) => {
                let _ = tx.send(SessionEvent::Exit(exit));
            }
            None => {
                state.subscribers.insert(id, tx);
            }
        }

        SessionSubscription {
            id,
            session_id: self.session_id.clone(),
            rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Exit status, once the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.state.lock().exit.clone()
    }

    /// Resolves once the exit event has been published.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_tx.subscribe();
        // Bound to a local so the watch borrow ends before `rx` is dropped.
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(UNKNOWN_EXIT),
            Err(_) => UNKNOWN_EXIT,
        };
        exit
    }

    fn unsubscribe(&self, id: SubscriberId) {
        self.state.lock().subscribers.remove(&id);
    }
}

const UNKNOWN_EXIT: ExitInfo = ExitInfo {
    exit_code: -1,
    signal: None,
};

/// A cancellable view of one session's output stream.
///
/// Dropping the subscription stops delivery to it.
pub struct SessionSubscription {
    id: SubscriberId,
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    hub: Weak<OutputHub>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event, or `None` once the stream has ended.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery and discards anything still queued.
    pub fn cancel(mut self) {
        self.rx.close();
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for SessionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSubscription")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
