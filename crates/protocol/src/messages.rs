//! Wire messages for the Termhub streaming endpoint.
//!
//! Every frame on a stream connection is a JSON text message discriminated
//! by its `type` field. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Reply content sent immediately while an assist request is in flight.
pub const ASSIST_LOADING_TEXT: &str = "Analyzing command and generating response...";

/// Message types a client may send.
const CLIENT_MESSAGE_TYPES: &[&str] = &["input", "resize", "assist"];

// ============================================================================
// Client -> Server
// ============================================================================

/// Messages sent by a client over a stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Keystrokes or pasted text, written to the PTY verbatim.
    Input {
        /// UTF-8 text to forward.
        data: String,
    },
    /// Terminal geometry change.
    Resize {
        /// New terminal rows.
        rows: u16,
        /// New terminal columns.
        cols: u16,
    },
    /// Request natural-language help for a command or its output.
    Assist {
        /// The command (or `command\nOutput:\noutput` for output analysis).
        #[serde(alias = "command")]
        query: String,
        /// Whether the query carries command output to analyze.
        #[serde(default)]
        is_output_analysis: bool,
    },
}

impl ClientMessage {
    /// Decodes and validates a client message from JSON text.
    ///
    /// Unknown `type` values and payloads that do not match their type are
    /// reported as distinct errors so the endpoint can tell the client which
    /// one it got wrong.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownMessageType(kind));
        }

        let message: ClientMessage =
            serde_json::from_value(value).map_err(|e| ProtocolError::MalformedMessage {
                kind,
                reason: e.to_string(),
            })?;

        message.validate()?;
        Ok(message)
    }

    /// Serializes the message to JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Checks semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let ClientMessage::Resize { rows, cols } = *self {
            validate_geometry(rows, cols)?;
        }
        Ok(())
    }
}

/// Rejects geometry with a zero dimension.
pub fn validate_geometry(rows: u16, cols: u16) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Err(ProtocolError::InvalidGeometry { rows, cols });
    }
    Ok(())
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Messages sent by the server over a stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once after the connection is attached to a session.
    Attached {
        /// The session this connection now streams.
        session_id: String,
        /// Current terminal rows.
        rows: u16,
        /// Current terminal columns.
        cols: u16,
    },
    /// Terminal output, in PTY production order.
    Output {
        /// UTF-8 text produced by the session.
        data: String,
    },
    /// An error. Non-recoverable errors are followed by a transport close.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },
    /// Assist progress or result.
    AssistResponse {
        /// Response text (or the loading notice).
        content: String,
        /// True for the immediate placeholder reply.
        is_loading: bool,
        /// True when the gateway failed or timed out.
        is_error: bool,
    },
}

impl ServerMessage {
    /// Creates an output message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }

    /// Creates an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// The placeholder sent as soon as an assist request is accepted.
    pub fn assist_loading() -> Self {
        ServerMessage::AssistResponse {
            content: ASSIST_LOADING_TEXT.to_string(),
            is_loading: true,
            is_error: false,
        }
    }

    /// A terminal assist reply carrying gateway content.
    pub fn assist_reply(content: impl Into<String>) -> Self {
        ServerMessage::AssistResponse {
            content: content.into(),
            is_loading: false,
            is_error: false,
        }
    }

    /// A terminal assist reply reporting a failure.
    pub fn assist_error(content: impl Into<String>) -> Self {
        ServerMessage::AssistResponse {
            content: content.into(),
            is_loading: false,
            is_error: true,
        }
    }

    /// Serializes the message to JSON text.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes a server message from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns true for an error that ends the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Error { code, .. } if !code.is_recoverable())
    }
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    /// No session with the requested id exists.
    SessionNotFound,
    /// The session was closed recently.
    SessionGone,
    /// The session closed while this connection was attached.
    SessionClosed,
    /// The shell process could not be started.
    SpawnFailed,
    /// The session cap has been reached.
    CapacityExceeded,
    /// A resize carried a zero dimension.
    InvalidGeometry,
    /// Output chunks were dropped because this connection fell behind.
    OutputOverflow,
    /// The client sent a message that could not be decoded.
    BadMessage,
    /// Server-side error.
    Internal,
}

impl ErrorCode {
    /// Whether the connection stays open after this error.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorCode::SessionNotFound
                | ErrorCode::SessionGone
                | ErrorCode::SessionClosed
                | ErrorCode::SpawnFailed
                | ErrorCode::CapacityExceeded
        )
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidGeometry { .. } => ErrorCode::InvalidGeometry,
            ProtocolError::Serialization(_) => ErrorCode::Internal,
            _ => ErrorCode::BadMessage,
        }
    }
}

// ============================================================================
// Session control types
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// PTY is being spawned.
    Starting,
    /// Recently written to.
    Active,
    /// No input for longer than the idle threshold.
    Idle,
    /// Teardown in progress.
    Closing,
    /// Process terminated and PTY released.
    Closed,
}

impl SessionState {
    /// Whether the session still accepts input.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Idle)
    }
}

/// Point-in-time description of one session, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Whether the session accepts input.
    pub active: bool,
    /// Lifecycle state.
    pub state: SessionState,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Last input or touch, Unix milliseconds.
    pub last_activity: u64,
    /// Seconds since the last activity.
    pub idle_time: u64,
    /// Shell command the session runs.
    pub shell_command: String,
    /// Terminal rows.
    pub rows: u16,
    /// Terminal columns.
    pub cols: u16,
}

/// Operational health counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Always `healthy` while the daemon serves requests.
    pub status: String,
    /// Seconds since the daemon started.
    pub uptime_seconds: u64,
    /// Sessions not yet closed.
    pub active_session_count: usize,
    /// Daemon version.
    pub version: String,
}
