//! Session manager for managing multiple PTY sessions.
//!
//! The manager is the single registry of sessions. It creates them, hands
//! them out by id, closes them, and runs the idle reaper. A session leaves the
//! registry as soon as it terminates, whether it was closed, reaped, or its
//! shell exited. Closed sessions leave a tombstone for a grace period so
//! recent lookups report "gone" instead of "not found".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::{HealthReport, SessionState, SessionSummary};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SessionError;
use super::multiplexer::OutputSubscription;
use super::pty::resolve_shell;
use super::terminal::{CloseReason, Session, SessionOptions};
use super::SessionId;
use crate::config::SessionConfig;

/// A subscription to one session's output.
pub struct Attachment {
    pub session: Arc<Session>,
    /// Output retained before the subscription was taken.
    pub scrollback: String,
    pub subscription: OutputSubscription,
}

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a session running `shell` (or the default shell).
    ///
    /// The session is registered before this returns, so its id is
    /// immediately visible to `get` and `list`. On failure nothing is
    /// registered.
    async fn create(&self, shell: Option<String>) -> Result<Arc<Session>, SessionError>;

    /// Looks up a live session.
    fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError>;

    /// Snapshot of all sessions that are not closing or closed.
    fn list(&self) -> Vec<SessionSummary>;

    /// Closes a session.
    ///
    /// Closing an already-closed session succeeds within the grace window
    /// and reports `NotFound` after it.
    async fn close(&self, session_id: &str) -> Result<(), SessionError>;

    /// Writes input to a session.
    fn write(&self, session_id: &str, data: &[u8]) -> Result<usize, SessionError>;

    /// Drains up to `max_bytes` of buffered output from a session.
    fn read(&self, session_id: &str, max_bytes: usize) -> Result<String, SessionError>;

    /// Resizes a session's terminal.
    fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), SessionError>;

    /// Subscribes to a live session's output with a queue of `capacity`
    /// chunks. The attachment carries the scrollback retained so far.
    fn attach(&self, session_id: &str, capacity: usize) -> Result<Attachment, SessionError>;

    /// Closes every session idle longer than the threshold. Returns how many.
    async fn reap(&self) -> usize;

    /// Operational counters.
    fn health(&self) -> HealthReport;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was registered.
    Created {
        /// The new session.
        session_id: SessionId,
    },
    /// A session was removed from the registry.
    Closed {
        /// The closed session.
        session_id: SessionId,
        /// Why it closed.
        reason: CloseReason,
    },
}

/// Policy values for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Shell used when a create request names none.
    pub default_shell: String,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Time without input after which a session is reaped.
    pub idle_timeout: Duration,
    /// How long closed ids report "gone" before "not found".
    pub close_grace: Duration,
    /// Bound on PTY startup.
    pub spawn_timeout: Duration,
    /// Time between SIGHUP and SIGKILL on close.
    pub terminate_grace: Duration,
    /// Initial rows for new sessions.
    pub default_rows: u16,
    /// Initial columns for new sessions.
    pub default_cols: u16,
    /// Output replayed to new connections.
    pub scrollback_bytes: usize,
    /// Output retained for poll-style reads.
    pub poll_buffer_bytes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for ManagerConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
            max_sessions: config.max_sessions,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            close_grace: Duration::from_secs(config.close_grace_secs),
            spawn_timeout: Duration::from_secs(config.spawn_timeout_secs),
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
            default_rows: config.default_rows,
            default_cols: config.default_cols,
            scrollback_bytes: config.scrollback_bytes,
            poll_buffer_bytes: config.poll_buffer_bytes,
        }
    }
}

/// Record of a recently closed session.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    closed_at: Instant,
}

/// Registry state shared with the per-session exit watchers.
struct Registry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Recently closed ids.
    tombstones: DashMap<SessionId, Tombstone>,
    /// Registered sessions plus creates in flight.
    reserved: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
}

impl Registry {
    fn release_slot(&self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Moves a closing or closed session from the table to the tombstones.
    ///
    /// Only the first call for a session has any effect.
    fn retire(&self, session: &Arc<Session>) {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));

        if removed.is_some() {
            self.tombstones.insert(
                session.id().clone(),
                Tombstone {
                    closed_at: Instant::now(),
                },
            );
            self.release_slot();
            let reason = session.close_reason().unwrap_or(CloseReason::Requested);
            let _ = self.events.send(SessionEvent::Closed {
                session_id: session.id().clone(),
                reason,
            });
            tracing::debug!(session_id = %session.id(), reason = %reason, "Session retired");
        }
    }
}

/// Thread-safe session manager implementation using DashMap.
pub struct SessionManagerImpl {
    config: ManagerConfig,
    registry: Arc<Registry>,
    started_at: Instant,
}

impl SessionManagerImpl {
    /// Creates a new session manager.
    pub fn new(config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            registry: Arc::new(Registry {
                sessions: DashMap::new(),
                tombstones: DashMap::new(),
                reserved: AtomicUsize::new(0),
                events,
            }),
            started_at: Instant::now(),
        }
    }

    /// Returns the manager's policy values.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.events.subscribe()
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.config.max_sessions;
        self.registry
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::CapacityExceeded(max))
    }

    /// Generates an id never handed out before in this process.
    fn fresh_id(&self) -> SessionId {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.registry.sessions.contains_key(&id)
                && !self.registry.tombstones.contains_key(&id)
            {
                return id;
            }
        }
    }

    /// Retires the session once it has terminated, whatever ended it.
    fn watch_termination(&self, session: &Arc<Session>) {
        let registry = Arc::clone(&self.registry);
        let terminated = session.terminated_token();
        let session = Arc::downgrade(session);
        tokio::spawn(async move {
            terminated.cancelled().await;
            if let Some(session) = session.upgrade() {
                registry.retire(&session);
            }
        });
    }

    fn session_options(&self, shell: Option<&str>) -> SessionOptions {
        SessionOptions {
            shell: resolve_shell(shell, &self.config.default_shell),
            rows: self.config.default_rows,
            cols: self.config.default_cols,
            idle_threshold: self.config.idle_timeout,
            spawn_timeout: self.config.spawn_timeout,
            terminate_grace: self.config.terminate_grace,
            scrollback_bytes: self.config.scrollback_bytes,
            poll_buffer_bytes: self.config.poll_buffer_bytes,
            env: Vec::new(),
        }
    }

    fn is_recently_closed(&self, session_id: &str) -> bool {
        self.registry
            .tombstones
            .get(session_id)
            .is_some_and(|t| t.closed_at.elapsed() <= self.config.close_grace)
    }

    /// Forgets tombstones older than the grace window.
    pub fn purge_tombstones(&self) -> usize {
        let grace = self.config.close_grace;
        let tombstones = &self.registry.tombstones;
        let before = tombstones.len();
        tombstones.retain(|_, t| t.closed_at.elapsed() <= grace);
        before - tombstones.len()
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.registry
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Starts the periodic reaper. It stops when `cancel` is cancelled.
    pub fn start_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = manager.reap().await;
                        if reaped > 0 {
                            tracing::info!(reaped = reaped, remaining = manager.count(), "Reaped idle sessions");
                        }
                    }
                }
            }
        })
    }

    /// Closes every session. Used at shutdown.
    pub async fn shutdown(&self) {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");

        join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown))).await;
        for session in &sessions {
            self.registry.retire(session);
        }
    }
}

impl Default for SessionManagerImpl {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl SessionManager for SessionManagerImpl {
    async fn create(&self, shell: Option<String>) -> Result<Arc<Session>, SessionError> {
        self.reserve_slot()?;

        let options = self.session_options(shell.as_deref());
        let session = match Session::create(Some(self.fresh_id()), options).await {
            Ok(session) => session,
            Err(e) => {
                self.registry.release_slot();
                tracing::warn!(error = %e, "Failed to create session");
                return Err(e);
            }
        };

        self.registry
            .sessions
            .insert(session.id().clone(), Arc::clone(&session));
        let _ = self.registry.events.send(SessionEvent::Created {
            session_id: session.id().clone(),
        });
        self.watch_termination(&session);

        tracing::info!(
            session_id = %session.id(),
            shell = %session.shell_command(),
            sessions = self.count(),
            "Created new session"
        );

        Ok(session)
    }

    fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.lookup(session_id) {
            return match session.state() {
                SessionState::Closing | SessionState::Closed => {
                    Err(SessionError::Gone(session_id.to_string()))
                }
                _ => Ok(session),
            };
        }

        if self.is_recently_closed(session_id) {
            Err(SessionError::Gone(session_id.to_string()))
        } else {
            Err(SessionError::NotFound(session_id.to_string()))
        }
    }

    fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .snapshot()
            .iter()
            .map(|s| s.summary())
            .filter(|s| s.state.is_live())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    async fn close(&self, session_id: &str) -> Result<(), SessionError> {
        match self.lookup(session_id) {
            Some(session) => {
                if session.close(CloseReason::Requested).await {
                    tracing::info!(session_id = %session_id, "Session closed by request");
                }
                self.registry.retire(&session);
                Ok(())
            }
            None if self.is_recently_closed(session_id) => Ok(()),
            None => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    fn write(&self, session_id: &str, data: &[u8]) -> Result<usize, SessionError> {
        self.get(session_id)?.write_input(data)
    }

    fn read(&self, session_id: &str, max_bytes: usize) -> Result<String, SessionError> {
        match self.lookup(session_id) {
            Some(session) => session.read_output(max_bytes),
            None => self.get(session_id).map(|_| String::new()),
        }
    }

    fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.get(session_id)?.resize(rows, cols)
    }

    fn attach(&self, session_id: &str, capacity: usize) -> Result<Attachment, SessionError> {
        let session = self.get(session_id)?;
        let (scrollback, subscription) = session.subscribe(capacity)?;
        Ok(Attachment {
            session,
            scrollback,
            subscription,
        })
    }

    async fn reap(&self) -> usize {
        let sessions = self.snapshot();
        let results = join_all(sessions.iter().map(|s| s.close_if_idle())).await;

        let mut reaped = 0;
        for (session, was_idle) in sessions.iter().zip(results) {
            if was_idle {
                reaped += 1;
                tracing::info!(session_id = %session.id(), "Reaped idle session");
                self.registry.retire(session);
            } else if session.state() == SessionState::Closed {
                self.registry.retire(session);
            }
        }

        self.purge_tombstones();
        reaped
    }

    fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_session_count: self.count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn count(&self) -> usize {
        self.registry
            .sessions
            .iter()
            .filter(|entry| entry.value().is_live())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn config() -> ManagerConfig {
        ManagerConfig {
            default_shell: "/bin/sh".to_string(),
            max_sessions: 8,
            idle_timeout: Duration::from_secs(600),
            close_grace: Duration::from_secs(60),
            spawn_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_millis(100),
            default_rows: 24,
            default_cols: 80,
            scrollback_bytes: 4096,
            poll_buffer_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn test_manager_create_session() {
        let manager = SessionManagerImpl::new(config());

        let session = manager.create(None).await.unwrap();
        assert_eq!(session.shell_command(), "/bin/sh");
        assert_eq!(manager.count(), 1);
        assert!(manager.get(session.id()).is_ok());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_manager_create_with_shell() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(Some("/bin/sh -i".to_string())).await.unwrap();
        assert_eq!(session.shell_command(), "/bin/sh -i");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_is_visible_before_return() {
        let manager = Arc::new(SessionManagerImpl::new(config()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let session = manager.create(None).await.unwrap();
                let id = session.id().clone();
                assert!(manager.get(&id).is_ok());
                assert!(manager.list().iter().any(|s| s.id == id));
                id
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(manager.list().len(), 4);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_registered() {
        let manager = SessionManagerImpl::new(config());
        let result = manager.create(Some("/nonexistent/shell".to_string())).await;

        assert!(matches!(result, Err(SessionError::Spawn(_))));
        assert!(manager.list().is_empty());
        assert_eq!(manager.count(), 0);

        // The slot was released.
        let session = manager.create(None).await.unwrap();
        assert!(manager.get(session.id()).is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let mut cfg = config();
        cfg.max_sessions = 2;
        let manager = SessionManagerImpl::new(cfg);

        let first = manager.create(None).await.unwrap();
        let _second = manager.create(None).await.unwrap();
        assert!(matches!(
            manager.create(None).await,
            Err(SessionError::CapacityExceeded(2))
        ));

        manager.close(first.id()).await.unwrap();
        assert!(manager.create(None).await.is_ok());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_nonexistent_session() {
        let manager = SessionManagerImpl::new(config());
        assert!(matches!(
            manager.get("nonexistent"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_nonexistent_session() {
        let manager = SessionManagerImpl::new(config());
        assert!(matches!(
            manager.close("nonexistent").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_removes_from_list_and_reports_gone() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();

        manager.close(&id).await.unwrap();

        assert!(manager.list().iter().all(|s| s.id != id));
        assert!(matches!(manager.get(&id), Err(SessionError::Gone(_))));
        assert!(matches!(
            manager.write(&id, b"ls\n"),
            Err(SessionError::Gone(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_idempotent_within_grace_only() {
        let mut cfg = config();
        cfg.close_grace = Duration::from_millis(200);
        let manager = SessionManagerImpl::new(cfg);
        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();

        manager.close(&id).await.unwrap();
        manager.close(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            manager.close(&id).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(manager.get(&id), Err(SessionError::NotFound(_))));
        assert_eq!(manager.purge_tombstones(), 1);
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();

        let written = manager.write(&id, b"echo manager_marker\n").unwrap();
        assert_eq!(written, 20);

        let mut seen = String::new();
        for _ in 0..50 {
            seen.push_str(&manager.read(&id, 1024).unwrap());
            if seen.contains("manager_marker") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(seen.contains("manager_marker"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_round_trip() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(None).await.unwrap();

        manager.resize(session.id(), 50, 160).unwrap();
        assert_eq!(manager.get(session.id()).unwrap().geometry(), (50, 160));
        let summary = manager.list().into_iter().next().unwrap();
        assert_eq!((summary.rows, summary.cols), (50, 160));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_snapshot_fields() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(None).await.unwrap();

        let list = manager.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, *session.id());
        assert!(list[0].active);
        assert_eq!(list[0].shell_command, "/bin/sh");

        manager.shutdown().await;
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_reap_closes_idle_sessions() {
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(100);
        let manager = SessionManagerImpl::new(cfg);

        let idle = manager.create(None).await.unwrap();
        let busy = manager.create(None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        busy.touch().unwrap();

        assert_eq!(manager.reap().await, 1);
        assert!(manager.list().iter().all(|s| s.id != *idle.id()));
        assert!(manager.get(busy.id()).is_ok());
        assert_eq!(idle.close_reason(), Some(CloseReason::IdleTimeout));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_session_is_retired_without_reaper() {
        let mut cfg = config();
        cfg.max_sessions = 1;
        let manager = SessionManagerImpl::new(cfg);
        let mut events = manager.subscribe_events();

        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();
        assert!(matches!(
            manager.create(None).await,
            Err(SessionError::CapacityExceeded(1))
        ));

        session.write_input(b"exit\n").unwrap();
        timeout(Duration::from_secs(5), session.terminated_token().cancelled())
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Created {
                session_id: id.clone()
            }
        );
        let closed = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no close event after the shell exited")
            .unwrap();
        assert_eq!(
            closed,
            SessionEvent::Closed {
                session_id: id.clone(),
                reason: CloseReason::ProcessExited
            }
        );

        assert_eq!(manager.count(), 0);
        assert!(matches!(manager.get(&id), Err(SessionError::Gone(_))));
        let replacement = manager.create(None).await.unwrap();
        assert_ne!(replacement.id(), &id);
        assert_eq!(manager.reap().await, 0);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reaper_race_with_touch() {
        // Touch and reap concurrently right at the idle boundary. A touch
        // that succeeded must leave the session alive; a session the reaper
        // closed must have refused the touch.
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(20);
        let manager = Arc::new(SessionManagerImpl::new(cfg));

        for trial in 0..25u64 {
            let session = manager.create(None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(18 + trial % 5)).await;

            let toucher = {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.touch().is_ok() })
            };
            let reaper = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.reap().await })
            };

            let touched = toucher.await.unwrap();
            reaper.await.unwrap();

            let alive = session.is_live();
            if touched && !alive {
                // Only legitimate if the touch itself aged out again.
                assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
                let idle_since_touch = crate::session::now_millis() - session.last_activity();
                assert!(idle_since_touch > 20, "trial {trial}: touched session reaped");
            }
            if !touched {
                assert!(!alive, "trial {trial}: touch refused on live session");
            }
            manager.close(session.id()).await.ok();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reaper_never_closes_active_session() {
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(150);
        let manager = Arc::new(SessionManagerImpl::new(cfg));
        let session = manager.create(None).await.unwrap();

        let cancel = CancellationToken::new();
        let reaper = manager.start_reaper(Duration::from_millis(1), cancel.clone());

        for _ in 0..60 {
            session.touch().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.is_live());

        cancel.cancel();
        reaper.await.unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_reaper_reaps() {
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(50);
        let manager = Arc::new(SessionManagerImpl::new(cfg));
        let session = manager.create(None).await.unwrap();

        let cancel = CancellationToken::new();
        let reaper = manager.start_reaper(Duration::from_millis(20), cancel.clone());

        timeout(Duration::from_secs(5), session.closed_token().cancelled())
            .await
            .unwrap();
        cancel.cancel();
        reaper.await.unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_attach_replays_scrollback() {
        let manager = SessionManagerImpl::new(config());
        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();

        manager.write(&id, b"echo attach-marker\n").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let attachment = manager.attach(&id, 16).unwrap();
            if attachment.scrollback.contains("attach-marker") {
                assert_eq!(attachment.session.id(), &id);
                break;
            }
            attachment.session.unsubscribe(&attachment.subscription);
            assert!(tokio::time::Instant::now() < deadline, "no scrollback");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        manager.close(&id).await.unwrap();
        assert!(matches!(
            manager.attach(&id, 16),
            Err(SessionError::Gone(_))
        ));
        assert!(matches!(
            manager.attach("missing", 16),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_events() {
        let manager = SessionManagerImpl::new(config());
        let mut events = manager.subscribe_events();

        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();
        manager.close(&id).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Created {
                session_id: id.clone()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Closed {
                session_id: id,
                reason: CloseReason::Requested
            }
        );
    }

    #[tokio::test]
    async fn test_health() {
        let manager = SessionManagerImpl::new(config());
        let _session = manager.create(None).await.unwrap();

        let health = manager.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.active_session_count, 1);
        assert!(!health.version.is_empty());

        manager.shutdown().await;
        assert_eq!(manager.health().active_session_count, 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let manager = SessionManagerImpl::new(config());
        let a = manager.create(None).await.unwrap();
        let b = manager.create(None).await.unwrap();
        assert_ne!(a.id(), b.id());
        manager.shutdown().await;
    }
}
