//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{HealthReport, SessionSummary};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout for the connect and for
    /// each request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let connect_future = UnixStream::connect(path);
        let stream = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })?
            .map_err(IpcError::Io)?;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))
            })?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request).map_err(IpcError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(IpcError::Io)?;
        self.writer.flush().await.map_err(IpcError::Io)?;

        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(IpcError::Io)?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        let response = serde_json::from_str(line.trim()).map_err(IpcError::Json)?;
        Ok(response)
    }

    /// Sends a request and turns an error response into [`IpcError::Remote`].
    async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        match self.send(request).await? {
            IpcResponse::Error { code, message } => Err(IpcError::Remote { code, message }),
            other => Ok(other),
        }
    }

    /// Returns `true` if the daemon answers a ping.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Fetches the daemon's health counters.
    pub async fn health(&mut self) -> Result<HealthReport, IpcError> {
        match self.request(IpcRequest::Health).await? {
            IpcResponse::Health(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.request(IpcRequest::Stop).await
    }

    /// Lists live sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.request(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Creates a session and returns its id.
    pub async fn create_session(&mut self, shell: Option<String>) -> Result<String, IpcError> {
        match self.request(IpcRequest::CreateSession { shell }).await? {
            IpcResponse::SessionCreated { session_id, .. } => Ok(session_id),
            other => Err(unexpected(other)),
        }
    }

    /// Describes one session.
    pub async fn get_session(&mut self, session_id: &str) -> Result<SessionSummary, IpcError> {
        let request = IpcRequest::GetSession {
            session_id: session_id.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::Session(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    /// Closes a session.
    pub async fn close_session(&mut self, session_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::CloseSession {
            session_id: session_id.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::SessionClosed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Writes input to a session and returns the bytes written.
    pub async fn write_session(&mut self, session_id: &str, data: &str) -> Result<usize, IpcError> {
        let request = IpcRequest::WriteSession {
            session_id: session_id.to_string(),
            data: data.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::Written { bytes_written } => Ok(bytes_written),
            other => Err(unexpected(other)),
        }
    }

    /// Drains buffered output from a session.
    pub async fn read_session(
        &mut self,
        session_id: &str,
        max_bytes: Option<usize>,
    ) -> Result<String, IpcError> {
        let request = IpcRequest::ReadSession {
            session_id: session_id.to_string(),
            max_bytes,
        };
        match self.request(request).await? {
            IpcResponse::Output { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    IpcError::UnexpectedResponse(format!("{:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::handler::IpcHandler;
    use crate::ipc::server::IpcServer;
    use crate::session::{ManagerConfig, SessionManager, SessionManagerImpl};
    use protocol::ErrorCode;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn serve(socket_path: &Path) -> (Arc<SessionManagerImpl>, CancellationToken) {
        let manager = Arc::new(SessionManagerImpl::new(ManagerConfig {
            default_shell: "/bin/sh".to_string(),
            ..ManagerConfig::default()
        }));
        let token = CancellationToken::new();
        let handler = Arc::new(IpcHandler::new(Arc::clone(&manager), token.clone()));
        let server = IpcServer::bind(socket_path).await.unwrap();
        tokio::spawn(server.serve(handler, token.clone()));
        (manager, token)
    }

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = IpcClient::connect(&socket_path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, IpcRequest::Ping);
            conn.send_response(&IpcResponse::Pong).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_session_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let (manager, _token) = serve(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let id = client.create_session(None).await.unwrap();

        let sessions = client.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(client.get_session(&id).await.unwrap().id, id);

        assert_eq!(client.write_session(&id, "true\n").await.unwrap(), 5);
        let _ = client.read_session(&id, Some(16)).await.unwrap();

        let health = client.health().await.unwrap();
        assert_eq!(health.active_session_count, 1);

        client.close_session(&id).await.unwrap();
        assert!(client.list_sessions().await.unwrap().is_empty());
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_client_remote_error() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _daemon = serve(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        match client.close_session("missing").await {
            Err(IpcError::Remote { code, .. }) => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_stop() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let (_manager, token) = serve(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        // Server that never responds
        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client =
            IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .unwrap();

        let result = client.ping().await;
        assert!(result.is_err());
    }
}
