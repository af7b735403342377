//! PTY-backed shell processes.
//!
//! A [`ProcessSession`] owns one shell running on a pseudo-terminal. Three
//! dedicated threads service it: a reader that publishes output into the
//! session's [`OutputHub`], a writer that drains the input queue into the
//! pty, and a waiter that reaps the child and publishes the exit event.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use protocol::timestamp_now;
use tokio::sync::mpsc;

use super::output::{ExitInfo, OutputHub, SessionSubscription};
use super::{OwnerId, SessionError, SessionId};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the waiter lets the reader drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace after SIGKILL before giving up on reaping.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment applied on top of the daemon's own, disabling color and
/// escape-sequence negotiation.
pub const SESSION_ENV: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("COLORTERM", ""),
    ("FORCE_COLOR", "0"),
    ("NO_COLOR", "1"),
];

/// Fully resolved parameters for spawning a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// A shell process bound to a pseudo-terminal.
pub struct ProcessSession {
    id: SessionId,
    owner_id: OwnerId,
    shell: String,
    cwd: PathBuf,

    master: Mutex<Box<dyn MasterPty + Send>>,
    size: Mutex<(u16, u16)>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    hub: Arc<OutputHub>,
    pid: Option<u32>,

    active: Arc<AtomicBool>,
    /// Set by the waiter once the child has been reaped; its pid may be reused.
    reaped: Arc<AtomicBool>,
    terminating: AtomicBool,
    /// Signal we sent to end the process, reported with the exit event.
    termination_signal: Arc<Mutex<Option<&'static str>>>,

    created_at: u64,
    last_activity: AtomicU64,
}

impl ProcessSession {
    /// Spawns `options.shell` on a fresh pty.
    ///
    /// Blocks while the process starts; call it from a blocking context.
    pub fn spawn(
        id: SessionId,
        owner_id: OwnerId,
        options: &SpawnOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.cwd(&options.cwd);
        for (key, value) in SESSION_ENV {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let hub = OutputHub::new(id.clone());
        let active = Arc::new(AtomicBool::new(true));
        let reaped = Arc::new(AtomicBool::new(false));
        let termination_signal = Arc::new(Mutex::new(None));
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let reader_done = spawn_reader(&id, reader, Arc::clone(&hub))?;
        spawn_writer(&id, writer, input_rx)?;
        spawn_waiter(
            &id,
            child,
            reader_done,
            Arc::clone(&hub),
            Arc::clone(&active),
            Arc::clone(&reaped),
            Arc::clone(&termination_signal),
        )?;

        let now = timestamp_now();
        let session = Arc::new(Self {
            id,
            owner_id,
            shell: options.shell.clone(),
            cwd: options.cwd.clone(),
            master: Mutex::new(pair.master),
            size: Mutex::new((options.cols, options.rows)),
            input_tx,
            hub,
            pid,
            active,
            reaped,
            terminating: AtomicBool::new(false),
            termination_signal,
            created_at: now,
            last_activity: AtomicU64::new(now),
        });

        tracing::debug!(
            session_id = %session.id,
            pid = ?pid,
            shell = %session.shell,
            "Spawned PTY process"
        );

        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    /// False once the process exited or termination was requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Creation time in Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last write or resize in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last write or resize.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(timestamp_now().saturating_sub(self.last_activity()))
    }

    pub fn subscribe(&self) -> SessionSubscription {
        self.hub.subscribe()
    }

    pub fn hub(&self) -> &Arc<OutputHub> {
        &self.hub
    }

    fn touch(&self) {
        self.last_activity.store(timestamp_now(), Ordering::Relaxed);
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::Inactive(self.id.clone()))
        }
    }

    /// Queues raw input for the pty. Never blocks on the process.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.input_tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| SessionError::Inactive(self.id.clone()))?;
        self.touch();
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }
        self.ensure_active()?;

        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        *self.size.lock() = (cols, rows);
        self.touch();

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Delivers a named signal (`SIGINT`, `INT`, `int`) to the process.
    pub fn signal(&self, name: &str) -> Result<(), SessionError> {
        let signal = parse_signal(name)?;
        self.ensure_active()?;
        self.send_signal(signal)?;

        tracing::debug!(session_id = %self.id, signal = %signal, "Delivered signal");
        Ok(())
    }

    /// True once the waiter has collected the child's exit status.
    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    fn send_signal(&self, signal: Signal) -> Result<(), SessionError> {
        if self.is_reaped() {
            return Err(SessionError::Inactive(self.id.clone()));
        }
        let pid = self
            .pid
            .ok_or_else(|| SessionError::SignalFailed("process id unavailable".to_string()))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| SessionError::SignalFailed(e.to_string()))
    }

    /// Marks the session inactive and ends the process: SIGHUP and SIGTERM,
    /// then SIGKILL if it is still running after `grace`.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn terminate(&self, grace: Duration) {
        if self.begin_termination() {
            self.finish_termination(grace).await;
        }
    }

    /// Marks the session inactive. Returns true for the first caller only,
    /// which then owns [`ProcessSession::finish_termination`].
    pub(crate) fn begin_termination(&self) -> bool {
        self.active.store(false, Ordering::SeqCst);
        !self.terminating.swap(true, Ordering::SeqCst)
    }

    pub(crate) async fn finish_termination(&self, grace: Duration) {
        if self.is_reaped() {
            self.hub.wait_exit().await;
            return;
        }

        // Interactive shells ignore SIGTERM but exit on hangup.
        *self.termination_signal.lock() = Some("SIGTERM");
        for signal in [Signal::SIGHUP, Signal::SIGTERM] {
            if let Err(e) = self.send_signal(signal) {
                tracing::debug!(session_id = %self.id, signal = %signal, error = %e, "Signal not delivered");
            }
        }

        if tokio::time::timeout(grace, self.hub.wait_exit()).await.is_ok() {
            return;
        }
        if self.is_reaped() {
            // Exited within the grace period; the reader is still draining.
            self.hub.wait_exit().await;
            return;
        }

        tracing::warn!(
            session_id = %self.id,
            grace_secs = grace.as_secs_f64(),
            "Process ignored SIGTERM, sending SIGKILL"
        );
        *self.termination_signal.lock() = Some("SIGKILL");
        if let Err(e) = self.send_signal(Signal::SIGKILL) {
            tracing::warn!(session_id = %self.id, error = %e, "SIGKILL not delivered");
        }

        if tokio::time::timeout(KILL_REAP_TIMEOUT, self.hub.wait_exit())
            .await
            .is_err()
        {
            tracing::error!(session_id = %self.id, "Process not reaped after SIGKILL");
        }
    }

    /// Whether termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("active", &self.is_active())
            .finish()
    }
}

fn spawn_reader(
    session_id: &SessionId,
    mut reader: Box<dyn Read + Send>,
    hub: Arc<OutputHub>,
) -> Result<std::sync::mpsc::Receiver<()>, SessionError> {
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let session_id = session_id.clone();

    std::thread::Builder::new()
        .name(format!("pty-reader-{}", short_id(&session_id)))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(n) => hub.publish(Bytes::copy_from_slice(&buffer[..n])),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up pty.
                        tracing::debug!(
                            session_id = %session_id,
                            error = %e,
                            "PTY read ended"
                        );
                        break;
                    }
                }
            }
            let _ = done_tx.send(());
        })
        .map_err(SessionError::Io)?;

    Ok(done_rx)
}

fn spawn_writer(
    session_id: &SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), SessionError> {
    let session_id = session_id.clone();

    std::thread::Builder::new()
        .name(format!("pty-writer-{}", short_id(&session_id)))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Error writing to PTY"
                    );
                    break;
                }
            }
            tracing::trace!(session_id = %session_id, "PTY writer finished");
        })
        .map_err(SessionError::Io)?;

    Ok(())
}

fn spawn_waiter(
    session_id: &SessionId,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    reader_done: std::sync::mpsc::Receiver<()>,
    hub: Arc<OutputHub>,
    active: Arc<AtomicBool>,
    reaped: Arc<AtomicBool>,
    termination_signal: Arc<Mutex<Option<&'static str>>>,
) -> Result<(), SessionError> {
    let session_id = session_id.clone();

    std::thread::Builder::new()
        .name(format!("pty-waiter-{}", short_id(&session_id)))
        .spawn(move || {
            let exit_code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to wait for PTY process"
                    );
                    -1
                }
            };
            reaped.store(true, Ordering::SeqCst);
            active.store(false, Ordering::SeqCst);

            // Let the reader flush whatever the process wrote before exiting.
            let _ = reader_done.recv_timeout(READER_DRAIN_TIMEOUT);

            let signal = if exit_code == 0 {
                None
            } else {
                (*termination_signal.lock()).map(str::to_string)
            };

            tracing::info!(
                session_id = %session_id,
                exit_code = exit_code,
                signal = ?signal,
                "PTY process exited"
            );
            hub.finish(ExitInfo { exit_code, signal });
        })
        .map_err(SessionError::Io)?;

    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Resolves `SIGINT`, `INT` or `int` to a signal.
pub fn parse_signal(name: &str) -> Result<Signal, SessionError> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse::<Signal>()
        .map_err(|_| SessionError::InvalidSignal(name.to_string()))
}

/// Picks the shell: the requested one, the configured default, `$SHELL`,
/// then `/bin/sh`.
pub fn detect_shell(requested: Option<String>, configured: Option<&str>) -> String {
    if let Some(shell) = requested.filter(|s| !s.trim().is_empty()) {
        return shell;
    }
    if let Some(shell) = configured.filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::output::SessionEvent;
    use tokio::time::timeout;

    fn sh_options() -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        }
    }

    fn spawn_sh() -> Arc<ProcessSession> {
        ProcessSession::spawn(
            uuid::Uuid::new_v4().to_string(),
            "owner-1".to_string(),
            &sh_options(),
        )
        .unwrap()
    }

    /// Collects output until `marker` shows up or the deadline passes.
    async fn read_until(sub: &mut SessionSubscription, marker: &str) -> String {
        let mut collected = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), sub.recv()).await {
                Ok(Some(SessionEvent::Output(data))) => {
                    collected.push_str(&String::from_utf8_lossy(&data));
                    if collected.contains(marker) {
                        break;
                    }
                }
                Ok(Some(SessionEvent::Exit(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }
        collected
    }

    async fn wait_for_exit(sub: &mut SessionSubscription) -> Option<ExitInfo> {
        for _ in 0..100 {
            match timeout(Duration::from_millis(100), sub.recv()).await {
                Ok(Some(SessionEvent::Exit(exit))) => return Some(exit),
                Ok(None) => return None,
                _ => {}
            }
        }
        None
    }

    #[test]
    fn test_detect_shell_prefers_request() {
        assert_eq!(
            detect_shell(Some("/bin/zsh".to_string()), Some("/bin/bash")),
            "/bin/zsh"
        );
        assert_eq!(detect_shell(None, Some("/bin/bash")), "/bin/bash");
        assert_eq!(
            detect_shell(Some("  ".to_string()), Some("/bin/bash")),
            "/bin/bash"
        );
        assert!(!detect_shell(None, None).is_empty());
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("SIGINT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("INT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal(" sigwinch ").unwrap(), Signal::SIGWINCH);
        assert!(matches!(
            parse_signal("SIGNOPE"),
            Err(SessionError::InvalidSignal(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_reports_configuration() {
        let session = spawn_sh();
        assert!(session.is_active());
        assert_eq!(session.size(), (80, 24));
        assert_eq!(session.shell(), "/bin/sh");
        assert_eq!(session.owner_id(), "owner-1");
        assert!(session.pid().is_some());
        session.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_spawn_missing_shell_fails() {
        let options = SpawnOptions {
            shell: "/nonexistent/shell".to_string(),
            ..sh_options()
        };
        let result = ProcessSession::spawn("s".to_string(), "o".to_string(), &options);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_produces_output() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.write(b"echo test_output_marker\n").unwrap();
        let output = read_until(&mut sub, "test_output_marker").await;
        assert!(output.contains("test_output_marker"), "got: {output:?}");

        session.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_session_environment_disables_color() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.write(b"echo \"term=$TERM no_color=$NO_COLOR\"\n").unwrap();
        let output = read_until(&mut sub, "term=dumb no_color=1").await;
        assert!(output.contains("term=dumb no_color=1"), "got: {output:?}");

        session.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_resize() {
        let session = spawn_sh();
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), (120, 40));

        assert!(matches!(
            session.resize(0, 40),
            Err(SessionError::InvalidGeometry { cols: 0, rows: 40 })
        ));
        session.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_exit_code_is_published() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.write(b"exit 42\n").unwrap();
        let exit = wait_for_exit(&mut sub).await.expect("no exit event");
        assert_eq!(exit.exit_code, 42);
        assert_eq!(exit.signal, None);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_inactive() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.write(b"exit 0\n").unwrap();
        wait_for_exit(&mut sub).await.expect("no exit event");

        assert!(matches!(
            session.write(b"echo hi\n"),
            Err(SessionError::Inactive(_))
        ));
        assert!(matches!(
            session.resize(100, 50),
            Err(SessionError::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_reports_signal() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.terminate(Duration::from_secs(2)).await;
        assert!(!session.is_active());

        let exit = wait_for_exit(&mut sub).await.expect("no exit event");
        assert!(exit.signal.is_some(), "exit: {exit:?}");
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        // Only the command's output contains TRAP2; the echoed input does not.
        session.write(b"trap '' HUP TERM; echo TRAP$((1+1))\n").unwrap();
        let output = read_until(&mut sub, "TRAP2").await;
        assert!(output.contains("TRAP2"), "got: {output:?}");

        session.terminate(Duration::from_millis(200)).await;
        let exit = wait_for_exit(&mut sub).await.expect("no exit event");
        assert_eq!(exit.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn test_reaped_process_is_never_signalled() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        session.write(b"exit 7\n").unwrap();
        let exit = wait_for_exit(&mut sub).await.expect("no exit event");
        assert_eq!(exit.exit_code, 7);
        assert!(session.is_reaped());

        assert!(matches!(
            session.send_signal(Signal::SIGTERM),
            Err(SessionError::Inactive(_))
        ));

        // Terminating an already reaped session neither signals nor waits.
        timeout(Duration::from_millis(500), session.terminate(Duration::from_secs(5)))
            .await
            .expect("terminate waited on a reaped process");
        assert_eq!(session.hub().exit_info().unwrap().signal, None);
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let session = spawn_sh();
        session.terminate(Duration::from_secs(1)).await;
        session.terminate(Duration::from_secs(1)).await;
        assert!(session.is_terminating());
    }

    #[tokio::test]
    async fn test_signal_interrupts_foreground() {
        let session = spawn_sh();
        let mut sub = session.subscribe();

        // Wait until the shell is reading commands, so its handlers are set.
        session.write(b"echo READY$((1+1))\n").unwrap();
        let output = read_until(&mut sub, "READY2").await;
        assert!(output.contains("READY2"), "got: {output:?}");

        session.signal("SIGINT").unwrap();
        assert!(matches!(
            session.signal("BOGUS"),
            Err(SessionError::InvalidSignal(_))
        ));

        // The shell survives SIGINT and keeps accepting input.
        session.write(b"echo ALIVE$((2+3))\n").unwrap();
        let output = read_until(&mut sub, "ALIVE5").await;
        assert!(output.contains("ALIVE5"), "got: {output:?}");

        session.terminate(Duration::from_secs(1)).await;
    }
}
