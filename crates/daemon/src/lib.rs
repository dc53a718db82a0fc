//! # Termhub Daemon Library
//!
//! Remote, multiplexed, reconnectable terminal sessions.
//!
//! ## Overview
//!
//! The daemon owns PTY-backed shell processes and streams them to any number
//! of clients. It provides:
//!
//! - **PTY Session Management**: create, list, write, read, resize and close
//!   sessions; idle sessions are reaped
//! - **Streaming Endpoint**: WebSocket connections attached to one session,
//!   with per-connection backpressure and assist requests
//! - **Assistance Gateway**: forwards command questions to an external model
//!   service
//! - **Local Control**: a Unix socket for the CLI
//! - **Reconnecting Client**: reattaches to a session after transport loss
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │    Idle      │  │      Assist          │  │
//! │  │   Manager    │  │   Reaper     │  │     Gateway          │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌───────────────────────────┐  ┌─────────────────────────────┐ │
//! │  │  Stream Server (/ws/{id}) │  │   IPC Server (daemon.sock)  │ │
//! │  └───────────────────────────┘  └─────────────────────────────┘ │
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
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until asked to stop.
//!     orchestrator.stop_requested().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the session manager
//! - [`stream`]: WebSocket streaming endpoint
//! - [`assist`]: Assistance gateway adapter
//! - [`ipc`]: Local session-control socket
//! - [`client`]: Reconnecting stream client
//! - [`orchestrator`]: Main daemon coordinator

pub mod assist;
pub mod client;
pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod session;
pub mod stream;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    CloseReason, Session, SessionError, SessionEvent, SessionId, SessionManager,
    SessionManagerImpl,
};

pub use assist::{AssistError, AssistGateway, AssistRequest};

pub use client::{ClientError, ClientEvent, ClientState, ReconnectPolicy, StreamClient};

pub use stream::{StreamContext, StreamServer};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
