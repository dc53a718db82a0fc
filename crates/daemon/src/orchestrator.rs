//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! all daemon subsystems: session management, the idle reaper, the streaming
//! server, the local control socket, and the assistance gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assist::{AssistGateway, DisabledAssistGateway, HttpAssistGateway};
use crate::config::Config;
use crate::ipc::{self, IpcHandler, IpcServer};
use crate::session::{
    CloseReason, ManagerConfig, SessionEvent, SessionId, SessionManager, SessionManagerImpl,
};
use crate::stream::{EndpointConfig, StreamContext, StreamServer};

/// Capacity of the orchestrator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
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
    /// A session was created.
    SessionCreated { session_id: SessionId },
    /// A session was closed.
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session manager for PTY sessions.
    session_manager: Arc<SessionManagerImpl>,
    /// Assistance gateway shared by all connections.
    gateway: Arc<dyn AssistGateway>,
    /// Control socket location.
    socket_path: PathBuf,
    /// Address the stream server bound, once running.
    local_addr: Option<SocketAddr>,
    /// Background tasks started by `start`.
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Cancelled when a control client asks the daemon to stop.
    stop_requested: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Nothing is bound or spawned until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let session_manager = Arc::new(SessionManagerImpl::new(ManagerConfig::from(
            &config.session,
        )));

        let gateway: Arc<dyn AssistGateway> = if config.assist.enabled {
            info!("Assist gateway: {}", config.assist.endpoint_url);
            Arc::new(
                HttpAssistGateway::new(config.assist.clone())
                    .context("Failed to initialize assist gateway")?,
            )
        } else {
            Arc::new(DisabledAssistGateway)
        };

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            gateway,
            socket_path: ipc::get_socket_path(),
            local_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Uses `path` for the control socket instead of the per-user default.
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = path;
        self
    }

    /// Returns the current orchestrator state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Subscribes to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Writes the pid file, starts the reaper, binds the stream server and
    /// the control socket.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running or starting");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.start_components().await {
            self.shutdown_token.cancel();
            for task in self.tasks.drain(..) {
                task.abort();
            }
            ipc::remove_pid_file(&self.config.pid_file_path());
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started");
        Ok(())
    }

    async fn start_components(&mut self) -> Result<()> {
        let pid_path = self.config.pid_file_path();
        ipc::write_pid_file(&pid_path)
            .with_context(|| format!("Failed to write pid file {}", pid_path.display()))?;

        let reap_interval = Duration::from_secs(self.config.session.reap_interval_secs);
        self.tasks.push(
            self.session_manager
                .start_reaper(reap_interval, self.shutdown_token.clone()),
        );
        self.tasks.push(self.spawn_event_loop());

        let context = StreamContext::new(
            Arc::clone(&self.session_manager),
            Arc::clone(&self.gateway),
            EndpointConfig::from(&self.config),
        );
        let server = StreamServer::bind(
            &self.config.server.bind_addr,
            context,
            self.config.server.max_message_size,
        )
        .await
        .with_context(|| format!("Failed to bind {}", self.config.server.bind_addr))?;
        self.local_addr = Some(server.local_addr()?);
        self.tasks
            .push(tokio::spawn(server.run(self.shutdown_token.clone())));

        let ipc_server = IpcServer::bind(&self.socket_path).await.with_context(|| {
            format!("Failed to bind control socket {}", self.socket_path.display())
        })?;
        let handler = Arc::new(IpcHandler::new(
            Arc::clone(&self.session_manager),
            self.stop_requested.clone(),
        ));
        self.tasks
            .push(tokio::spawn(ipc_server.serve(handler, self.shutdown_token.clone())));

        Ok(())
    }

    /// Relays manager events and drops assist history of closed sessions.
    fn spawn_event_loop(&self) -> JoinHandle<()> {
        let mut events = self.session_manager.subscribe_events();
        let gateway = Arc::clone(&self.gateway);
        let event_tx = self.event_tx.clone();
        let cancel = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(SessionEvent::Created { session_id }) => {
                        info!(session_id = %session_id, "Session created");
                        let _ = event_tx.send(OrchestratorEvent::SessionCreated { session_id });
                    }
                    Ok(SessionEvent::Closed { session_id, reason }) => {
                        info!(session_id = %session_id, reason = %reason, "Session closed");
                        gateway.forget(&session_id);
                        let _ =
                            event_tx.send(OrchestratorEvent::SessionClosed { session_id, reason });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Session event loop lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Sessions are closed first so every attached connection receives its
    /// terminal message, then the listeners stop.
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

        self.session_manager.shutdown().await;
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task failed: {}", e);
                }
            }
        }

        ipc::remove_pid_file(&self.config.pid_file_path());
        self.local_addr = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        debug!(event = ?event, "Orchestrator event");
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Address of the stream server while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Path of the control socket.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.session_manager.count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Cancelled when a control client sends a stop request.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }
}
