//! # Termhub Protocol Library
//!
//! Wire definitions shared by the Termhub daemon and its clients.
//!
//! ## Overview
//!
//! - **Messages**: [`ClientMessage`] and [`ServerMessage`], JSON text frames
//!   discriminated by a `type` field
//! - **Error codes**: [`ErrorCode`], the machine-readable half of every
//!   server `error` frame
//! - **Session control types**: [`SessionSummary`], [`SessionState`] and
//!   [`HealthReport`], returned by the local control surface
//! - **Paths**: [`parse_stream_path`] maps `/ws` and `/ws/{id}` to a
//!   [`StreamTarget`]
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage};
//!
//! let msg = ClientMessage::from_json(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
//! assert_eq!(msg, ClientMessage::Resize { rows: 40, cols: 120 });
//!
//! let reply = ServerMessage::output("hi\r\n").to_json().unwrap();
//! assert!(reply.contains(r#""type":"output""#));
//! ```

pub mod error;
pub mod messages;
pub mod path;

pub use error::{ProtocolError, Result};
pub use messages::{
    validate_geometry, ClientMessage, ErrorCode, HealthReport, ServerMessage, SessionState,
    SessionSummary, ASSIST_LOADING_TEXT,
};
pub use path::{is_valid_session_id, parse_stream_path, stream_path, StreamTarget};
