//! Assistance gateway adapter.
//!
//! Streaming connections forward `assist` requests here. The gateway turns a
//! command (or a command plus its output) into a prompt, sends it to an
//! external model service and returns the reply text. Callers own the
//! response timeout.

pub mod http;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

pub use http::HttpAssistGateway;

/// Separator between the command and its captured output in an
/// output-analysis query.
pub const OUTPUT_SEPARATOR: &str = "\nOutput:\n";

/// Reply for a command-explanation request with nothing to explain.
pub const EMPTY_QUERY_REPLY: &str = "Please provide a command to explain.";

/// Output longer than this many characters is cut down to its head and tail.
const MAX_OUTPUT_CHARS: usize = 4000;
const OUTPUT_KEEP_CHARS: usize = 2000;
const TRUNCATION_MARKER: &str = "...[output truncated]...";

/// Errors from an assistance request.
#[derive(Debug, Error)]
pub enum AssistError {
    #[error("assistance request timed out after {0:?}")]
    Timeout(Duration),

    #[error("assistance gateway unavailable: {0}")]
    Unavailable(String),

    #[error("assistance gateway returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode gateway response: {0}")]
    Decode(String),

    #[error("assistance gateway returned an empty response")]
    EmptyResponse,
}

impl AssistError {
    /// Text shown to the user in an error reply.
    pub fn user_message(&self) -> String {
        match self {
            AssistError::Timeout(after) => format!(
                "The assistant did not respond within {} seconds. Please try again.",
                after.as_secs().max(1)
            ),
            AssistError::Unavailable(_) => "The assistant is not available.".to_string(),
            AssistError::Http { .. } | AssistError::Decode(_) | AssistError::EmptyResponse => {
                "The assistant could not process this request.".to_string()
            }
        }
    }
}

/// A normalized assistance request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistRequest {
    /// Explain a command.
    Command { command: String },
    /// Explain what a command printed.
    Output { command: String, output: String },
}

impl AssistRequest {
    /// Builds a request from a raw client query.
    ///
    /// Command queries drop a leading `?` and surrounding whitespace.
    /// Returns `None` for a command query that is empty afterwards.
    pub fn from_query(query: &str, is_output_analysis: bool) -> Option<Self> {
        if is_output_analysis {
            let (command, output) = match query.split_once(OUTPUT_SEPARATOR) {
                Some((command, output)) => (command, output),
                None => (query, ""),
            };
            return Some(AssistRequest::Output {
                command: command.trim().to_string(),
                output: truncate_output(output),
            });
        }

        let trimmed = query.trim();
        let command = trimmed.strip_prefix('?').unwrap_or(trimmed).trim();
        if command.is_empty() {
            None
        } else {
            Some(AssistRequest::Command {
                command: command.to_string(),
            })
        }
    }

    /// The user prompt sent to the model.
    pub fn prompt(&self) -> String {
        match self {
            AssistRequest::Command { command } => {
                format!("Please explain this command concisely: {command}")
            }
            AssistRequest::Output { command, output } => format!(
                "Please explain the output of this command: {command}\n\nOutput:\n{output}"
            ),
        }
    }
}

fn truncate_output(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let head: String = output.chars().take(OUTPUT_KEEP_CHARS).collect();
    let tail: String = output.chars().skip(total - OUTPUT_KEEP_CHARS).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// Boxed future returned by [`AssistGateway::analyze`].
pub type AssistFuture<'a> = Pin<Box<dyn Future<Output = Result<String, AssistError>> + Send + 'a>>;

/// Outbound interface to the assistance service.
pub trait AssistGateway: Send + Sync {
    /// Analyzes a request on behalf of a session and returns the reply text.
    fn analyze<'a>(&'a self, session_id: &'a str, request: &'a AssistRequest) -> AssistFuture<'a>;

    /// Drops any conversation state held for a session.
    fn forget(&self, _session_id: &str) {}
}

/// Gateway used when assistance is turned off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAssistGateway;

impl AssistGateway for DisabledAssistGateway {
    fn analyze<'a>(&'a self, _session_id: &'a str, _request: &'a AssistRequest) -> AssistFuture<'a> {
        Box::pin(async { Err(AssistError::Unavailable("assistance is disabled".to_string())) })
    }
}
