//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Message shape errors
    /// The message carried no `type` discriminator.
    #[error("message has no type field")]
    MissingType,

    /// The `type` discriminator names a message this protocol does not define.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The `type` is known but the payload fields are wrong.
    #[error("malformed {kind} message: {reason}")]
    MalformedMessage {
        /// The message type that failed to decode.
        kind: String,
        /// Decoder diagnostic.
        reason: String,
    },

    /// Terminal geometry with a zero dimension.
    #[error("invalid terminal geometry: {rows}x{cols}")]
    InvalidGeometry {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },

    /// The path does not name a stream endpoint.
    #[error("invalid stream path: {0}")]
    InvalidPath(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_unknown_message_type_display() {
        let err = ProtocolError::UnknownMessageType("llm".to_string());
        assert_eq!(err.to_string(), "unknown message type: llm");
    }

    #[test]
    fn test_malformed_message_display() {
        let err = ProtocolError::MalformedMessage {
            kind: "resize".to_string(),
            reason: "missing field `rows`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed resize message: missing field `rows`"
        );
    }

    #[test]
    fn test_invalid_geometry_display() {
        let err = ProtocolError::InvalidGeometry { rows: 0, cols: 80 };
        assert_eq!(err.to_string(), "invalid terminal geometry: 0x80");
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
