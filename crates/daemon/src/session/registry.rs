//! Session registry.
//!
//! The registry is the single owner of every [`ProcessSession`]. It keeps two
//! indexes, session id to session and owner id to session ids, under one lock
//! so they are always mutated together. Sessions leave the registry on an
//! explicit close, on process exit, or when the idle sweep evicts them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use protocol::SessionCreateRequest;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::output::{ExitInfo, SessionSubscription};
use super::pty::{detect_shell, ProcessSession, SpawnOptions};
use super::{OwnerId, SessionError, SessionId};

/// Exit code `timeout(1)` uses for an expired command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Registry operations used by connections and the HTTP surface.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionRegistry: Send + Sync {
    /// Spawns a shell for `owner_id` and registers it.
    ///
    /// The returned subscription is opened before the exit watcher starts, so
    /// it sees every byte of output and the exit event even if the process
    /// ends at once. Nothing is registered if the process cannot be started.
    async fn create(
        &self,
        owner_id: &OwnerId,
        requested: SessionOptions,
    ) -> Result<CreatedSession, SessionError>;

    /// Opens an output subscription for a session.
    fn subscribe(&self, session_id: &SessionId) -> Result<SessionSubscription, SessionError>;

    /// Forwards raw bytes to a session's input.
    fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session's terminal.
    fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Delivers a named signal to a session's process.
    fn signal(&self, session_id: &SessionId, signal: &str) -> Result<(), SessionError>;

    /// Removes a session and terminates its process in the background.
    ///
    /// Idempotent. Returns whether the session was registered.
    fn close(&self, session_id: &SessionId) -> bool;

    /// Removes a session from both indexes without touching its process.
    fn cleanup(&self, session_id: &SessionId) -> bool;

    /// Describes one session.
    fn get(&self, session_id: &SessionId) -> Option<SessionSummary>;

    /// Lists the sessions owned by `owner_id`.
    fn list_for_owner(&self, owner_id: &OwnerId) -> Vec<SessionSummary>;

    /// Number of registered sessions.
    fn active_count(&self) -> usize;

    /// Closes every session and waits for their processes to end.
    async fn close_all(&self);
}

/// Per-request session parameters. Unset fields fall back to
/// [`SessionDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl From<SessionCreateRequest> for SessionOptions {
    fn from(req: SessionCreateRequest) -> Self {
        Self {
            shell: req.shell,
            cwd: req.cwd.filter(|c| !c.is_empty()).map(PathBuf::from),
            cols: req.cols,
            rows: req.rows,
        }
    }
}

/// Registry-wide defaults and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Zero means unlimited.
    pub max_sessions: usize,
    /// Time between SIGTERM and SIGKILL when closing.
    pub kill_grace: Duration,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            cols: 80,
            rows: 24,
            max_sessions: 0,
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl SessionDefaults {
    fn resolve(&self, requested: SessionOptions) -> SpawnOptions {
        let cwd = requested
            .cwd
            .or_else(|| self.cwd.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        SpawnOptions {
            shell: detect_shell(requested.shell, self.shell.as_deref()),
            cwd,
            cols: requested.cols.filter(|c| *c > 0).unwrap_or(self.cols),
            rows: requested.rows.filter(|r| *r > 0).unwrap_or(self.rows),
        }
    }
}

/// Snapshot of one session, as listed to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub is_active: bool,
}

impl SessionSummary {
    fn of(session: &ProcessSession) -> Self {
        let (cols, rows) = session.size();
        Self {
            id: session.id().clone(),
            owner_id: session.owner_id().clone(),
            shell: session.shell().to_string(),
            cwd: session.cwd().display().to_string(),
            cols,
            rows,
            created_at: session.created_at(),
            last_activity_at: session.last_activity(),
            is_active: session.is_active(),
        }
    }
}

/// A freshly registered session and its first output subscription.
#[derive(Debug)]
pub struct CreatedSession {
    /// Resolved options as spawned.
    pub summary: SessionSummary,
    pub subscription: SessionSubscription,
}

impl CreatedSession {
    pub fn id(&self) -> &SessionId {
        &self.summary.id
    }
}

/// How a session's process ended, as far as lifecycle policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit code 124: the command timed out. Cleaned up, never retried.
    TimedOut,
    /// Ended by our own termination request.
    Terminated,
    /// Exit code zero.
    Normal,
    /// Non-zero exit the daemon did not cause.
    Abnormal,
}

impl ExitDisposition {
    pub fn classify(exit: &ExitInfo, terminated_by_daemon: bool) -> Self {
        if exit.exit_code == TIMEOUT_EXIT_CODE {
            ExitDisposition::TimedOut
        } else if terminated_by_daemon {
            ExitDisposition::Terminated
        } else if exit.exit_code == 0 {
            ExitDisposition::Normal
        } else {
            ExitDisposition::Abnormal
        }
    }
}

#[derive(Default)]
struct Indexes {
    sessions: HashMap<SessionId, Arc<ProcessSession>>,
    by_owner: HashMap<OwnerId, HashSet<SessionId>>,
}

impl Indexes {
    fn insert(&mut self, session: Arc<ProcessSession>) {
        self.by_owner
            .entry(session.owner_id().clone())
            .or_default()
            .insert(session.id().clone());
        self.sessions.insert(session.id().clone(), session);
    }

    fn remove(&mut self, session_id: &SessionId) -> Option<Arc<ProcessSession>> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_owner.get_mut(session.owner_id()) {
            ids.remove(session_id);
            if ids.is_empty() {
                self.by_owner.remove(session.owner_id());
            }
        }
        Some(session)
    }
}

struct RegistryInner {
    indexes: RwLock<Indexes>,
    defaults: SessionDefaults,
    terminations: TaskTracker,
}

impl RegistryInner {
    fn lookup(&self, session_id: &SessionId) -> Result<Arc<ProcessSession>, SessionError> {
        self.indexes
            .read()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    fn cleanup(&self, session_id: &SessionId) -> bool {
        let removed = self.indexes.write().remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id = %session_id, "Removed session from registry");
        }
        removed
    }

    fn close(&self, session_id: &SessionId) -> bool {
        let Some(session) = self.indexes.write().remove(session_id) else {
            return false;
        };

        if session.begin_termination() {
            let grace = self.defaults.kill_grace;
            self.terminations.spawn(async move {
                session.finish_termination(grace).await;
            });
        }

        tracing::info!(session_id = %session_id, "Closed session");
        true
    }
}

/// The production registry, backed by real pseudo-terminals.
///
/// Cloning is cheap and every clone shares the same sessions.
#[derive(Clone)]
pub struct PtySessionRegistry {
    inner: Arc<RegistryInner>,
}

impl PtySessionRegistry {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                indexes: RwLock::new(Indexes::default()),
                defaults,
                terminations: TaskTracker::new(),
            }),
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.inner.defaults
    }

    fn at_capacity(&self, indexes: &Indexes) -> bool {
        let max = self.inner.defaults.max_sessions;
        max > 0 && indexes.sessions.len() >= max
    }

    /// Applies the exit policy once the process ends, then cleans up.
    fn watch_exit(&self, session: Arc<ProcessSession>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let exit = session.hub().wait_exit().await;
            let disposition = ExitDisposition::classify(&exit, session.is_terminating());
            let session_id = session.id().clone();

            match disposition {
                ExitDisposition::TimedOut => tracing::info!(
                    session_id = %session_id,
                    "Session command timed out, cleaning up"
                ),
                ExitDisposition::Abnormal => tracing::warn!(
                    session_id = %session_id,
                    exit_code = exit.exit_code,
                    "Session exited abnormally, cleaning up"
                ),
                ExitDisposition::Normal | ExitDisposition::Terminated => tracing::debug!(
                    session_id = %session_id,
                    exit_code = exit.exit_code,
                    disposition = ?disposition,
                    "Session ended"
                ),
            }

            inner.cleanup(&session_id);
        });
    }

    /// Closes every active session idle for at least `idle_timeout`.
    ///
    /// Returns the ids that were closed.
    pub fn sweep_idle(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .inner
            .indexes
            .read()
            .sessions
            .values()
            .filter(|s| s.is_active() && s.idle_for() >= idle_timeout)
            .map(|s| s.id().clone())
            .collect();

        idle.into_iter()
            .filter(|id| {
                let closed = self.inner.close(id);
                if closed {
                    tracing::info!(session_id = %id, "Closed idle session");
                }
                closed
            })
            .collect()
    }

    /// Starts a background task that periodically evicts idle sessions.
    ///
    /// # Arguments
    /// * `interval` - How often to sweep.
    /// * `idle_timeout` - Inactivity after which a session is closed.
    /// * `cancel` - Stops the task.
    pub fn start_idle_sweep(
        &self,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Idle sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let closed = registry.sweep_idle(idle_timeout);
                        if !closed.is_empty() {
                            tracing::info!(count = closed.len(), "Idle sweep closed sessions");
                        }
                    }
                }
            }
        })
    }

    /// Ids of every registered session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.indexes.read().sessions.keys().cloned().collect()
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let indexes = self.inner.indexes.read();
        let mut indexed = 0;
        for (owner, ids) in &indexes.by_owner {
            assert!(!ids.is_empty(), "empty owner entry for {owner}");
            for id in ids {
                let session = indexes
                    .sessions
                    .get(id)
                    .unwrap_or_else(|| panic!("{id} indexed by owner but not registered"));
                assert_eq!(session.owner_id(), owner);
                indexed += 1;
            }
        }
        assert_eq!(indexed, indexes.sessions.len());
    }
}

impl SessionRegistry for PtySessionRegistry {
    async fn create(
        &self,
        owner_id: &OwnerId,
        requested: SessionOptions,
    ) -> Result<CreatedSession, SessionError> {
        let max = self.inner.defaults.max_sessions;
        if self.at_capacity(&self.inner.indexes.read()) {
            return Err(SessionError::LimitReached(max));
        }

        let options = self.inner.defaults.resolve(requested);
        let session_id = Uuid::new_v4().to_string();

        let session = {
            let session_id = session_id.clone();
            let owner_id = owner_id.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || {
                ProcessSession::spawn(session_id, owner_id, &options)
            })
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))??
        };

        {
            let mut indexes = self.inner.indexes.write();
            if self.at_capacity(&indexes) {
                drop(indexes);
                if session.begin_termination() {
                    let grace = self.inner.defaults.kill_grace;
                    self.inner.terminations.spawn(async move {
                        session.finish_termination(grace).await;
                    });
                }
                return Err(SessionError::LimitReached(max));
            }
            indexes.insert(Arc::clone(&session));
        }

        let created = CreatedSession {
            summary: SessionSummary::of(&session),
            subscription: session.subscribe(),
        };
        self.watch_exit(Arc::clone(&session));

        tracing::info!(
            session_id = %session_id,
            owner_id = %owner_id,
            shell = %options.shell,
            cwd = %options.cwd.display(),
            cols = options.cols,
            rows = options.rows,
            "Created new session"
        );

        Ok(created)
    }

    fn subscribe(&self, session_id: &SessionId) -> Result<SessionSubscription, SessionError> {
        Ok(self.inner.lookup(session_id)?.subscribe())
    }

    fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        self.inner.lookup(session_id)?.write(data)
    }

    fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.inner.lookup(session_id)?.resize(cols, rows)
    }

    fn signal(&self, session_id: &SessionId, signal: &str) -> Result<(), SessionError> {
        self.inner.lookup(session_id)?.signal(signal)
    }

    fn close(&self, session_id: &SessionId) -> bool {
        self.inner.close(session_id)
    }

    fn cleanup(&self, session_id: &SessionId) -> bool {
        self.inner.cleanup(session_id)
    }

    fn get(&self, session_id: &SessionId) -> Option<SessionSummary> {
        self.inner
            .indexes
            .read()
            .sessions
            .get(session_id)
            .map(|s| SessionSummary::of(s))
    }

    fn list_for_owner(&self, owner_id: &OwnerId) -> Vec<SessionSummary> {
        let indexes = self.inner.indexes.read();
        let Some(ids) = indexes.by_owner.get(owner_id) else {
            return Vec::new();
        };
        let mut summaries: Vec<SessionSummary> = ids
            .iter()
            .filter_map(|id| indexes.sessions.get(id))
            .map(|s| SessionSummary::of(s))
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    fn active_count(&self) -> usize {
        self.inner.indexes.read().sessions.len()
    }

    async fn close_all(&self) {
        let ids = self.session_ids();
        let count = ids.len();
        for id in &ids {
            self.inner.close(id);
        }

        let tracker = &self.inner.terminations;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();

        tracing::info!(count = count, "Closed all sessions");
    }
}
