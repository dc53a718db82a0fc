//! Session error taxonomy.

use std::time::Duration;

use protocol::ErrorCode;
use thiserror::Error;

use super::SessionId;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The PTY or shell process could not be started.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// The PTY did not start within the configured timeout.
    #[error("PTY spawn timed out after {0:?}")]
    SpawnTimeout(Duration),

    /// No session with this id is known.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session was closed recently and is no longer usable.
    #[error("session expired: {0}")]
    Gone(SessionId),

    /// The session is closing or closed.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// The configured session cap has been reached.
    #[error("session limit reached ({0} sessions)")]
    CapacityExceeded(usize),

    /// Terminal geometry with a zero dimension.
    #[error("invalid terminal geometry: {rows}x{cols}")]
    InvalidGeometry {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
}

impl SessionError {
    /// Maps the error onto the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Spawn(_) | SessionError::SpawnTimeout(_) => ErrorCode::SpawnFailed,
            SessionError::NotFound(_) => ErrorCode::SessionNotFound,
            SessionError::Gone(_) => ErrorCode::SessionGone,
            SessionError::Closed(_) => ErrorCode::SessionClosed,
            SessionError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
            SessionError::InvalidGeometry { .. } => ErrorCode::InvalidGeometry,
        }
    }

    /// A message safe to show to a remote user.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::NotFound(id) | SessionError::Gone(id) => format!(
                "Session {} not found or expired. Create a new session to continue.",
                id
            ),
            SessionError::Closed(id) => format!("Session {} has been closed.", id),
            SessionError::Spawn(_) | SessionError::SpawnTimeout(_) => {
                "Failed to start a shell for the new session.".to_string()
            }
            other => other.to_string(),
        }
    }
}
