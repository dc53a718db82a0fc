//! PTY session management.
//!
//! - [`pty`]: the PTY process wrapper
//! - [`terminal`]: one session's lifecycle and activity bookkeeping
//! - [`multiplexer`]: output fan-out with bounded per-subscriber queues
//! - [`manager`]: the session registry and idle reaper

pub mod error;
pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod terminal;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::SessionError;
pub use manager::{Attachment, ManagerConfig, SessionEvent, SessionManager, SessionManagerImpl};
pub use multiplexer::{ClientStats, OutputBroadcaster, OutputChunk, OutputSubscription, Utf8Decoder};
pub use pty::{resolve_shell, PtyProcess, SpawnOptions};
pub use terminal::{CloseReason, Session, SessionOptions};

/// Unique identifier for a session.
pub type SessionId = String;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
