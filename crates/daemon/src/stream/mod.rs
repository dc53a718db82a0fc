//! Streaming protocol endpoint.
//!
//! Each WebSocket connection is attached to exactly one session. The
//! [`server`] accepts connections and routes them by path; the
//! [`endpoint`] drives one connection until it or its session ends.

pub mod endpoint;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use crate::assist::AssistGateway;
use crate::config::Config;
use crate::session::SessionManagerImpl;

pub use endpoint::handle_connection;
pub use server::StreamServer;

/// Per-connection policy.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Output chunks queued per connection before new chunks are dropped.
    pub output_buffer_chunks: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// How long an assist request may take before a timeout reply is sent.
    pub assist_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            output_buffer_chunks: 256,
            ping_interval: Duration::from_secs(30),
            assist_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for EndpointConfig {
    fn from(config: &Config) -> Self {
        Self {
            output_buffer_chunks: config.stream.output_buffer_chunks,
            ping_interval: Duration::from_secs(config.server.ping_interval_secs.max(1)),
            assist_timeout: Duration::from_secs(config.assist.timeout_secs),
        }
    }
}

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct StreamContext {
    pub manager: Arc<SessionManagerImpl>,
    pub gateway: Arc<dyn AssistGateway>,
    pub config: EndpointConfig,
}

impl StreamContext {
    pub fn new(
        manager: Arc<SessionManagerImpl>,
        gateway: Arc<dyn AssistGateway>,
        config: EndpointConfig,
    ) -> Self {
        Self {
            manager,
            gateway,
            config,
        }
    }
}
