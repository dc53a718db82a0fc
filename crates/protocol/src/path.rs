//! Stream endpoint paths.
//!
//! `/ws` opens a new session, `/ws/{id}` attaches to an existing one.

use crate::error::{ProtocolError, Result};

/// Prefix shared by every stream path.
pub const STREAM_PATH_PREFIX: &str = "/ws";

/// What a stream connection asked to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// Create a session with the default shell and attach to it.
    New,
    /// Attach to an existing session.
    Existing(String),
}

/// Parses the request path of a stream connection.
///
/// Query strings are ignored. Session ids are restricted to ASCII
/// alphanumerics and `-`.
pub fn parse_stream_path(path: &str) -> Result<StreamTarget> {
    let path = path.split('?').next().unwrap_or_default();
    let rest = path
        .strip_prefix(STREAM_PATH_PREFIX)
        .ok_or_else(|| ProtocolError::InvalidPath(path.to_string()))?;

    match rest {
        "" | "/" => Ok(StreamTarget::New),
        _ => {
            let id = rest
                .strip_prefix('/')
                .ok_or_else(|| ProtocolError::InvalidPath(path.to_string()))?;
            if is_valid_session_id(id) {
                Ok(StreamTarget::Existing(id.to_string()))
            } else {
                Err(ProtocolError::InvalidPath(path.to_string()))
            }
        }
    }
}

/// Builds the stream path for a session id.
pub fn stream_path(session_id: &str) -> String {
    format!("{STREAM_PATH_PREFIX}/{session_id}")
}

/// Returns true if `id` is a syntactically valid session id.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
