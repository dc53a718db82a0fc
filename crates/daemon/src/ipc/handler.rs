//! Request dispatch for the session-control socket.

use std::sync::Arc;

use protocol::ErrorCode;
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse, DEFAULT_READ_BYTES};
use crate::session::{SessionError, SessionManager, SessionManagerImpl};

/// Answers IPC requests against the session manager.
pub struct IpcHandler {
    manager: Arc<SessionManagerImpl>,
    shutdown: CancellationToken,
}

impl IpcHandler {
    /// `shutdown` is cancelled when a client sends [`IpcRequest::Stop`].
    pub fn new(manager: Arc<SessionManagerImpl>, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown }
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Health => IpcResponse::Health(self.manager.health()),
            IpcRequest::Stop => {
                tracing::info!("Stop requested over IPC");
                self.shutdown.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.manager.list(),
            },
            IpcRequest::CreateSession { shell } => match self.manager.create(shell).await {
                Ok(session) => IpcResponse::SessionCreated {
                    session_id: session.id().clone(),
                    created_at: session.created_at(),
                },
                Err(e) => error_response(e),
            },
            IpcRequest::GetSession { session_id } => match self.manager.get(&session_id) {
                Ok(session) => IpcResponse::Session(session.summary()),
                Err(e) => error_response(e),
            },
            IpcRequest::CloseSession { session_id } => {
                match self.manager.close(&session_id).await {
                    Ok(()) => IpcResponse::SessionClosed { session_id },
                    Err(e) => error_response(e),
                }
            }
            IpcRequest::WriteSession { session_id, data } => {
                match self.manager.write(&session_id, data.as_bytes()) {
                    Ok(bytes_written) => IpcResponse::Written { bytes_written },
                    Err(e) => error_response(e),
                }
            }
            IpcRequest::ReadSession {
                session_id,
                max_bytes,
            } => {
                let max_bytes = max_bytes.unwrap_or(DEFAULT_READ_BYTES);
                match self.manager.read(&session_id, max_bytes) {
                    Ok(data) => IpcResponse::Output { data },
                    Err(e) => error_response(e),
                }
            }
            IpcRequest::ResizeSession {
                session_id,
                rows,
                cols,
            } => match self.manager.resize(&session_id, rows, cols) {
                Ok(()) => IpcResponse::Resized { rows, cols },
                Err(e) => error_response(e),
            },
        }
    }
}

fn error_response(error: SessionError) -> IpcResponse {
    let code = error.code();
    if code == ErrorCode::SpawnFailed {
        tracing::warn!(error = %error, "Session request failed");
    }
    IpcResponse::error(code, error.user_message())
}
