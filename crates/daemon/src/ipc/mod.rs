//! Unix Domain Socket IPC for the local session-control surface.
//!
//! The CLI drives a running daemon through this channel: health, stop, and
//! the session operations (create, list, get, close, write, poll-read,
//! resize).
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol for simplicity and
//! debugging convenience. Each message is a single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
//! - Fallback: `/tmp/termhub-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     for session in client.list_sessions().await? {
//!         println!("{} {}", session.id, session.shell_command);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod handler;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use handler::IpcHandler;
pub use messages::{IpcRequest, IpcResponse, DEFAULT_READ_BYTES};
pub use pidfile::{get_daemon_pid, is_daemon_running, remove_pid_file, write_pid_file};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termhub/daemon.sock`
/// 2. Otherwise: `/tmp/termhub-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("termhub").join("daemon.sock");
        }
    }

    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/termhub-{}", uid)).join("daemon.sock")
}
