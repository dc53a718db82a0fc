//! WebSocket server for the streaming endpoint.
//!
//! `GET /ws` creates a session and attaches to it; `GET /ws/{id}` attaches
//! to an existing one. Any other path is refused during the handshake.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use protocol::{parse_stream_path, StreamTarget};

use super::endpoint::handle_connection;
use super::StreamContext;

/// Accepts streaming connections.
pub struct StreamServer {
    listener: TcpListener,
    context: StreamContext,
    ws_config: WebSocketConfig,
}

impl StreamServer {
    /// Binds the server. Port 0 picks a free port.
    pub async fn bind(
        addr: &str,
        context: StreamContext,
        max_message_size: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_message_size);
        ws_config.max_frame_size = Some(max_message_size);

        Ok(Self {
            listener,
            context,
            ws_config,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires.
    ///
    /// Open connections are not interrupted; they end with their sessions.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Stream server listening on ws://{}", addr);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stream server stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.context.clone();
                        let ws_config = self.ws_config;
                        tokio::spawn(async move {
                            accept_connection(stream, peer, context, ws_config).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP accept error");
                    }
                },
            }
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: StreamContext,
    ws_config: WebSocketConfig,
) {
    let _ = stream.set_nodelay(true);

    let mut target = None;
    let callback = |request: &Request, response: Response| {
        route(request).map(|t| {
            target = Some(t);
            response
        })
    };

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let Some(target) = target else {
        return;
    };

    tracing::debug!(peer = %peer, target = ?target, "Stream connection accepted");
    let reason = handle_connection(ws, target, context).await;
    tracing::debug!(peer = %peer, reason = ?reason, "Stream connection finished");
}

#[allow(clippy::result_large_err)] // ErrorResponse size is dictated by tungstenite's API
fn route(request: &Request) -> Result<StreamTarget, ErrorResponse> {
    parse_stream_path(request.uri().path()).map_err(|e| {
        let mut response = ErrorResponse::new(Some(e.to_string()));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_route_new_session() {
        assert_eq!(route(&request("/ws")).unwrap(), StreamTarget::New);
        assert_eq!(route(&request("/ws/")).unwrap(), StreamTarget::New);
    }

    #[test]
    fn test_route_existing_session() {
        assert_eq!(
            route(&request("/ws/abc-123?token=x")).unwrap(),
            StreamTarget::Existing("abc-123".to_string())
        );
    }

    #[test]
    fn test_route_rejects_other_paths() {
        for uri in ["/", "/api/sessions", "/ws/a/b", "/ws/bad%20id"] {
            let rejection = route(&request(uri)).unwrap_err();
            assert_eq!(rejection.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
