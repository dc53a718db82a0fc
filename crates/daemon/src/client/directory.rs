//! Session existence lookups used between reconnection attempts.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use super::ClientError;
use crate::ipc::IpcClient;

/// Boxed future returned by [`SessionDirectory::session_exists`].
pub type DirectoryFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, ClientError>> + Send + 'a>>;

/// Answers whether a session can still be attached to.
pub trait SessionDirectory: Send + Sync {
    fn session_exists<'a>(&'a self, session_id: &'a str) -> DirectoryFuture<'a>;
}

/// Looks sessions up through the daemon's control socket.
#[derive(Debug, Clone)]
pub struct IpcSessionDirectory {
    socket_path: PathBuf,
}

impl IpcSessionDirectory {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

impl SessionDirectory for IpcSessionDirectory {
    fn session_exists<'a>(&'a self, session_id: &'a str) -> DirectoryFuture<'a> {
        Box::pin(async move {
            let mut client = IpcClient::connect(&self.socket_path)
                .await
                .map_err(|e| ClientError::Directory(e.to_string()))?;
            let sessions = client
                .list_sessions()
                .await
                .map_err(|e| ClientError::Directory(e.to_string()))?;
            Ok(sessions
                .iter()
                .any(|s| s.id == session_id && s.state.is_live()))
        })
    }
}
