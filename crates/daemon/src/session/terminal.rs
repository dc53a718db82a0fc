//! Terminal session: lifecycle and activity bookkeeping around one PTY.
//!
//! A [`Session`] owns its [`PtyProcess`] and the [`OutputBroadcaster`] that
//! fans the PTY output out to connections. Input is queued and written by a
//! per-session writer task on the blocking pool, so a shell that stops
//! reading never stalls a caller. Lifecycle transitions happen under
//! a single mutex so that the reaper's idle check and its transition to
//! `Closing` cannot interleave with an input write or a touch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use protocol::{SessionState, SessionSummary};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SessionError;
use super::multiplexer::{OutputBroadcaster, OutputSubscription};
use super::pty::{PtyProcess, SpawnOptions};
use super::{now_millis, SessionId};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close request.
    Requested,
    /// Closed by the idle reaper.
    IdleTimeout,
    /// The shell process exited on its own.
    ProcessExited,
    /// The daemon is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::Requested => "closed by request",
            CloseReason::IdleTimeout => "closed after idle timeout",
            CloseReason::ProcessExited => "shell process exited",
            CloseReason::Shutdown => "server shutting down",
        };
        f.write_str(text)
    }
}

/// Stored lifecycle phase. `Idle` is derived from activity, not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Active,
    Closing,
    Closed,
}

struct Lifecycle {
    phase: Phase,
    reason: Option<CloseReason>,
}

/// Per-session policy values.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Resolved shell command.
    pub shell: String,
    /// Initial rows.
    pub rows: u16,
    /// Initial columns.
    pub cols: u16,
    /// Time without input after which the session counts as idle.
    pub idle_threshold: Duration,
    /// Bound on PTY startup.
    pub spawn_timeout: Duration,
    /// Time between SIGHUP and SIGKILL on close.
    pub terminate_grace: Duration,
    /// Bytes of output replayed to new subscribers.
    pub scrollback_bytes: usize,
    /// Bytes of output retained for poll-style reads.
    pub poll_buffer_bytes: usize,
    /// Extra environment for the shell.
    pub env: Vec<(String, String)>,
}

impl SessionOptions {
    /// Options with defaults suitable for tests and embedding.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            rows: 24,
            cols: 80,
            idle_threshold: Duration::from_secs(30 * 60),
            spawn_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_millis(500),
            scrollback_bytes: 50_000,
            poll_buffer_bytes: 64 * 1024,
            env: Vec::new(),
        }
    }
}

/// One shell process plus its PTY, tracked from creation to close.
pub struct Session {
    id: SessionId,
    shell_command: String,
    created_at: u64,
    last_activity: AtomicU64,
    idle_threshold: Duration,
    terminate_grace: Duration,
    lifecycle: Mutex<Lifecycle>,
    geometry: Mutex<(u16, u16)>,
    pty: Arc<PtyProcess>,
    output: OutputBroadcaster,
    input: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
    terminated: CancellationToken,
}

impl Session {
    /// Starts a shell under a new PTY and returns the active session.
    ///
    /// Allocates a UUID when `id` is `None`. The spawn runs on the blocking
    /// pool and is bounded by `options.spawn_timeout`; a spawn that finishes
    /// after the timeout is terminated rather than leaked.
    pub async fn create(
        id: Option<SessionId>,
        options: SessionOptions,
    ) -> Result<Arc<Self>, SessionError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let spawn_options = SpawnOptions {
            shell: options.shell.clone(),
            rows: options.rows,
            cols: options.cols,
            env: options.env.clone(),
            cwd: None,
        };
        let mut spawn = tokio::task::spawn_blocking(move || PtyProcess::spawn(&spawn_options));

        let pty = match tokio::time::timeout(options.spawn_timeout, &mut spawn).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(SessionError::Spawn(format!("spawn task failed: {}", e))),
            Err(_) => {
                let grace = options.terminate_grace;
                tokio::spawn(async move {
                    if let Ok(Ok(pty)) = spawn.await {
                        tokio::task::spawn_blocking(move || pty.terminate(grace));
                    }
                });
                return Err(SessionError::SpawnTimeout(options.spawn_timeout));
            }
        };

        let now = now_millis();
        let (input, input_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            shell_command: options.shell,
            created_at: now,
            last_activity: AtomicU64::new(now),
            idle_threshold: options.idle_threshold,
            terminate_grace: options.terminate_grace,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Starting,
                reason: None,
            }),
            geometry: Mutex::new((options.rows, options.cols)),
            pty: Arc::new(pty),
            output: OutputBroadcaster::new(options.scrollback_bytes, options.poll_buffer_bytes),
            input,
            closed: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        session.start(input_rx);
        Ok(session)
    }

    /// Launches the output pump and the input writer, then moves the
    /// session to active.
    fn start(self: &Arc<Self>, input: mpsc::UnboundedReceiver<Bytes>) {
        tokio::spawn(run_input_writer(
            Arc::downgrade(self),
            Arc::clone(&self.pty),
            self.closed.clone(),
            input,
        ));

        if let Some(reader) = self.pty.take_reader() {
            let reader_loop = self.output.start_reader_loop(reader);
            let weak: Weak<Session> = Arc::downgrade(self);
            tokio::spawn(async move {
                let _ = reader_loop.await;
                if let Some(session) = weak.upgrade() {
                    if session.close(CloseReason::ProcessExited).await {
                        tracing::info!(session_id = %session.id, "Shell process exited");
                    }
                }
            });
        }

        self.lock_lifecycle().phase = Phase::Active;
        tracing::info!(
            session_id = %self.id,
            shell = %self.shell_command,
            pid = ?self.pty.pid(),
            "Session started"
        );
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_idle_at(&self, now: u64) -> bool {
        let idle_ms = now.saturating_sub(self.last_activity.load(Ordering::SeqCst));
        Duration::from_millis(idle_ms) > self.idle_threshold
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the shell command line.
    pub fn shell_command(&self) -> &str {
        &self.shell_command
    }

    /// Creation time in Unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Last input or touch in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        let lifecycle = self.lock_lifecycle();
        match lifecycle.phase {
            Phase::Starting => SessionState::Starting,
            Phase::Active if self.is_idle_at(now_millis()) => SessionState::Idle,
            Phase::Active => SessionState::Active,
            Phase::Closing => SessionState::Closing,
            Phase::Closed => SessionState::Closed,
        }
    }

    /// Whether the session accepts input.
    pub fn is_live(&self) -> bool {
        self.lock_lifecycle().phase == Phase::Active
    }

    /// Reason for closing, once a close has begun.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock_lifecycle().reason
    }

    /// Current `(rows, cols)`.
    pub fn geometry(&self) -> (u16, u16) {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records activity without I/O.
    pub fn touch(&self) -> Result<(), SessionError> {
        let lifecycle = self.lock_lifecycle();
        if lifecycle.phase != Phase::Active {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.last_activity.store(now_millis(), Ordering::SeqCst);
        Ok(())
    }

    /// Queues input for the PTY verbatim and records activity.
    ///
    /// Never waits on the PTY: the bytes are written in call order by the
    /// session's writer task. A later write failure means the process is gone
    /// and closes the session. Returns the number of bytes queued.
    pub fn write_input(&self, data: &[u8]) -> Result<usize, SessionError> {
        self.touch()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.input
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| SessionError::Closed(self.id.clone()))?;
        Ok(data.len())
    }

    /// Changes the terminal geometry. Repeating the same size is a no-op success.
    pub fn resize(self: &Arc<Self>, rows: u16, cols: u16) -> Result<(), SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidGeometry { rows, cols });
        }
        if !self.is_live() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        let mut geometry = self.geometry.lock().unwrap_or_else(PoisonError::into_inner);
        if *geometry == (rows, cols) {
            return Ok(());
        }
        if let Err(e) = self.pty.resize(rows, cols) {
            drop(geometry);
            tracing::debug!(session_id = %self.id, error = %e, "PTY resize failed");
            self.close_in_background(CloseReason::ProcessExited);
            return Err(SessionError::Closed(self.id.clone()));
        }
        *geometry = (rows, cols);

        tracing::debug!(session_id = %self.id, rows = rows, cols = cols, "Resized PTY");
        Ok(())
    }

    /// Subscribes to output with a queue of `capacity` chunks.
    ///
    /// Returns the retained scrollback and the live subscription; nothing is
    /// duplicated or lost between the two.
    pub fn subscribe(&self, capacity: usize) -> Result<(String, OutputSubscription), SessionError> {
        if !self.is_live() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.output
            .subscribe(capacity)
            .ok_or_else(|| SessionError::Closed(self.id.clone()))
    }

    /// Drops a subscription's registration.
    pub fn unsubscribe(&self, subscription: &OutputSubscription) {
        if let Some(stats) = self.output.unsubscribe(subscription.id()) {
            tracing::debug!(
                session_id = %self.id,
                sent = stats.messages_sent,
                dropped = stats.messages_dropped,
                "Subscriber detached"
            );
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.output.client_count()
    }

    /// Drains up to `max_bytes` of output for poll-style readers.
    ///
    /// Buffered output remains readable after close; once it is drained,
    /// reads fail with [`SessionError::Closed`].
    pub fn read_output(&self, max_bytes: usize) -> Result<String, SessionError> {
        let data = self.output.read_polled(max_bytes);
        if data.is_empty() && !self.is_live() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(data)
    }

    /// Token cancelled once the session begins closing.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Token cancelled once the process is reaped and the session is closed.
    pub fn terminated_token(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Begins closing if the session is live. Returns true if this call won.
    fn begin_close(&self, reason: CloseReason) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if matches!(lifecycle.phase, Phase::Closing | Phase::Closed) {
            return false;
        }
        lifecycle.phase = Phase::Closing;
        lifecycle.reason = Some(reason);
        true
    }

    /// Begins closing only if no activity happened within the idle threshold.
    ///
    /// The idle check and the transition to closing happen in one critical
    /// section, so a session touched concurrently is never closed by this.
    fn begin_close_if_idle(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.phase != Phase::Active || !self.is_idle_at(now_millis()) {
            return false;
        }
        lifecycle.phase = Phase::Closing;
        lifecycle.reason = Some(CloseReason::IdleTimeout);
        true
    }

    /// Terminates the process and releases the PTY. Runs once per session.
    async fn finish_close(&self) {
        let reason = self.close_reason().unwrap_or(CloseReason::Requested);
        self.closed.cancel();

        let pty = Arc::clone(&self.pty);
        let grace = self.terminate_grace;
        let exit_code = tokio::task::spawn_blocking(move || pty.terminate(grace))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(session_id = %self.id, error = %e, "Terminate task panicked");
                None
            });

        self.output.close();
        self.lock_lifecycle().phase = Phase::Closed;
        self.terminated.cancel();

        tracing::info!(
            session_id = %self.id,
            reason = %reason,
            exit_code = ?exit_code,
            "Session closed"
        );
    }

    /// Closes the session. Idempotent: later calls return immediately.
    ///
    /// Returns true if this call performed the close.
    pub async fn close(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        self.finish_close().await;
        true
    }

    /// Closes the session if it has been idle longer than its threshold.
    ///
    /// Returns true if the session was closed by this call.
    pub async fn close_if_idle(&self) -> bool {
        if !self.begin_close_if_idle() {
            return false;
        }
        self.finish_close().await;
        true
    }

    fn close_in_background(self: &Arc<Self>, reason: CloseReason) {
        if self.begin_close(reason) {
            let session = Arc::clone(self);
            tokio::spawn(async move { session.finish_close().await });
        }
    }

    /// Point-in-time summary for listings.
    pub fn summary(&self) -> SessionSummary {
        let now = now_millis();
        let state = self.state();
        let last_activity = self.last_activity();
        let (rows, cols) = self.geometry();
        SessionSummary {
            id: self.id.clone(),
            active: state.is_live(),
            state,
            created_at: self.created_at,
            last_activity,
            idle_time: now.saturating_sub(last_activity) / 1000,
            shell_command: self.shell_command.clone(),
            rows,
            cols,
        }
    }
}

/// Writes queued input to the PTY in arrival order.
///
/// Each write runs on the blocking pool; the next chunk is not taken until the
/// previous one has been written. Ends when the session closes or is dropped.
async fn run_input_writer(
    session: Weak<Session>,
    pty: Arc<PtyProcess>,
    closed: CancellationToken,
    mut input: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let data = tokio::select! {
            _ = closed.cancelled() => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        let pty = Arc::clone(&pty);
        let failure = match tokio::task::spawn_blocking(move || pty.write(&data)).await {
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("write task failed: {}", e),
        };

        if let Some(session) = session.upgrade() {
            tracing::debug!(session_id = %session.id, error = %failure, "PTY write failed");
            session.close_in_background(CloseReason::ProcessExited);
        }
        break;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell_command", &self.shell_command)
            .field("state", &self.state())
            .finish()
    }
}
