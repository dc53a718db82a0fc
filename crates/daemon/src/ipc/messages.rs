//! IPC message types for CLI-daemon communication.
//!
//! Requests mirror the session-control surface: create, list, get, close,
//! write and poll-read sessions, plus daemon health and shutdown.

use protocol::{ErrorCode, HealthReport, SessionSummary};
use serde::{Deserialize, Serialize};

/// Bytes returned by a read request that does not specify a limit.
pub const DEFAULT_READ_BYTES: usize = 1024;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the daemon's health counters.
    Health,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Create a session.
    CreateSession {
        /// Shell command; the configured default when absent.
        shell: Option<String>,
    },
    /// Describe one session.
    GetSession { session_id: String },
    /// Close a session.
    CloseSession { session_id: String },
    /// Write input to a session.
    WriteSession { session_id: String, data: String },
    /// Drain buffered output from a session.
    ReadSession {
        session_id: String,
        /// At most this many bytes; [`DEFAULT_READ_BYTES`] when absent.
        max_bytes: Option<usize>,
    },
    /// Resize a session's terminal.
    ResizeSession {
        session_id: String,
        rows: u16,
        cols: u16,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Health counters.
    Health(HealthReport),
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Live sessions, oldest first.
    Sessions { sessions: Vec<SessionSummary> },
    /// One session.
    Session(SessionSummary),
    /// A session was created.
    SessionCreated { session_id: String, created_at: u64 },
    /// A session was closed.
    SessionClosed { session_id: String },
    /// Input was written.
    Written { bytes_written: usize },
    /// Buffered output.
    Output { data: String },
    /// The terminal was resized.
    Resized { rows: u16, cols: u16 },
    /// An error occurred processing the request.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Creates an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            code,
            message: message.into(),
        }
    }
}
