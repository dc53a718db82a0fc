//! Stream client with reconnection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use protocol::{stream_path, ClientMessage, ErrorCode, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ClientError, ClientEvent, ClientState, ReconnectPolicy, SessionDirectory};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How one connection ended.
#[derive(Debug)]
enum ConnectionEnd {
    /// The caller detached.
    Detached,
    /// The server closed normally without an error.
    Closed,
    /// The server reported a non-recoverable error.
    Terminated { code: ErrorCode, message: String },
    /// Transport failure or abnormal close.
    Lost,
}

/// Keeps one session attached across transport failures.
pub struct StreamClient {
    url: Url,
    session_id: String,
    policy: ReconnectPolicy,
    directory: Arc<dyn SessionDirectory>,
    cancel: CancellationToken,
    state: ClientState,
}

impl StreamClient {
    /// `server` is the endpoint base, e.g. `ws://127.0.0.1:8767`.
    pub fn new(
        server: &str,
        session_id: impl Into<String>,
        policy: ReconnectPolicy,
        directory: Arc<dyn SessionDirectory>,
    ) -> Result<Self, ClientError> {
        let session_id = session_id.into();
        let url = Url::parse(server)
            .and_then(|base| base.join(&stream_path(&session_id)))
            .map_err(|e| ClientError::InvalidUrl(format!("{server}: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme {other}"
                )))
            }
        }

        Ok(Self {
            url,
            session_id,
            policy,
            directory,
            cancel: CancellationToken::new(),
            state: ClientState::Connecting,
        })
    }

    /// Cancelling this token detaches the client, including mid-backoff.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn set_state(&mut self, state: ClientState, events: &mpsc::Sender<ClientEvent>) {
        if self.state != state {
            tracing::debug!(session_id = %self.session_id, from = ?self.state, to = ?state, "Client state changed");
            self.state = state;
        }
        let _ = events.send(ClientEvent::StateChanged(state)).await;
    }

    async fn fail(
        &mut self,
        error: ClientError,
        events: &mpsc::Sender<ClientEvent>,
    ) -> Result<(), ClientError> {
        tracing::warn!(session_id = %self.session_id, error = %error, "Stream client failed");
        self.set_state(ClientState::Failed, events).await;
        Err(error)
    }

    /// Streams `input` to the session and server messages to `events` until
    /// the caller detaches, the server ends the session, or reconnection
    /// gives up.
    ///
    /// Returns `Ok` on a normal detach or close.
    pub async fn run(
        &mut self,
        mut input: mpsc::Receiver<ClientMessage>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(), ClientError> {
        let cancel = self.cancel.clone();
        let mut attempt: u32 = 0;
        self.set_state(ClientState::Connecting, &events).await;

        loop {
            tracing::info!(url = %self.url, attempt = attempt, "Connecting to session");

            let end = match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => {
                    attempt = 0;
                    self.set_state(ClientState::Attached, &events).await;
                    self.pump(ws, &mut input, &events).await
                }
                Err(WsError::Http(response)) => {
                    let status = response.status().as_u16();
                    return self.fail(ClientError::Rejected { status }, &events).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Connect failed");
                    ConnectionEnd::Lost
                }
            };

            match end {
                ConnectionEnd::Detached | ConnectionEnd::Closed => {
                    self.set_state(ClientState::Closed, &events).await;
                    return Ok(());
                }
                ConnectionEnd::Terminated { code, message } => {
                    return self
                        .fail(ClientError::Terminated { code, message }, &events)
                        .await;
                }
                ConnectionEnd::Lost => {}
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                let attempts = self.policy.max_attempts;
                return self
                    .fail(ClientError::RetriesExhausted { attempts }, &events)
                    .await;
            }

            self.set_state(ClientState::Reconnecting, &events).await;
            let delay = self.policy.delay(attempt);
            tracing::info!("reconnecting in {:?}", delay);
            let _ = events
                .send(ClientEvent::RetryScheduled { attempt, delay })
                .await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ClientState::Closed, &events).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.directory.session_exists(&self.session_id).await {
                Ok(true) => {}
                Ok(false) => {
                    let gone = ClientError::SessionGone(self.session_id.clone());
                    return self.fail(gone, &events).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Session lookup failed, retrying anyway");
                }
            }
        }
    }

    async fn pump(
        &self,
        ws: WsStream,
        input: &mut mpsc::Receiver<ClientMessage>,
        events: &mpsc::Sender<ClientEvent>,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut terminal: Option<(ErrorCode, String)> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(Some(detach_frame()))).await;
                    return ConnectionEnd::Detached;
                }

                message = input.recv() => {
                    let Some(message) = message else {
                        let _ = sink.send(WsMessage::Close(Some(detach_frame()))).await;
                        return ConnectionEnd::Detached;
                    };
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unencodable message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(json)).await {
                        tracing::debug!(error = %e, "Send failed");
                        return end_of_stream(terminal);
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let message = match ServerMessage::from_json(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring undecodable server message");
                                continue;
                            }
                        };
                        if message.is_terminal() {
                            if let ServerMessage::Error { code, message: text } = &message {
                                terminal = Some((*code, text.clone()));
                            }
                        }
                        if events.send(ClientEvent::Message(message)).await.is_err() {
                            let _ = sink.send(WsMessage::Close(Some(detach_frame()))).await;
                            return ConnectionEnd::Detached;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        if terminal.is_some() {
                            return end_of_stream(terminal);
                        }
                        return match frame {
                            Some(frame) if frame.code == CloseCode::Normal => ConnectionEnd::Closed,
                            other => {
                                tracing::debug!(frame = ?other, "Abnormal close");
                                ConnectionEnd::Lost
                            }
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Stream error");
                        return end_of_stream(terminal);
                    }
                    None => return end_of_stream(terminal),
                },
            }
        }
    }
}

fn end_of_stream(terminal: Option<(ErrorCode, String)>) -> ConnectionEnd {
    match terminal {
        Some((code, message)) => ConnectionEnd::Terminated { code, message },
        None => ConnectionEnd::Lost,
    }
}

fn detach_frame() -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::Normal,
        reason: "client detached".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assist::DisabledAssistGateway;
    use crate::client::DirectoryFuture;
    use crate::session::{ManagerConfig, SessionManager, SessionManagerImpl};
    use crate::stream::{EndpointConfig, StreamContext, StreamServer};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct FakeDirectory {
        exists: AtomicBool,
        lookups: AtomicUsize,
    }

    impl FakeDirectory {
        fn new(exists: bool) -> Arc<Self> {
            Arc::new(Self {
                exists: AtomicBool::new(exists),
                lookups: AtomicUsize::new(0),
            })
        }
    }

    impl SessionDirectory for FakeDirectory {
        fn session_exists<'a>(&'a self, _session_id: &'a str) -> DirectoryFuture<'a> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let exists = self.exists.load(Ordering::SeqCst);
            Box::pin(async move { Ok(exists) })
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    async fn start_server() -> (Arc<SessionManagerImpl>, String, CancellationToken) {
        let manager = Arc::new(SessionManagerImpl::new(ManagerConfig {
            default_shell: "/bin/sh".to_string(),
            ..ManagerConfig::default()
        }));
        let context = StreamContext::new(
            Arc::clone(&manager),
            Arc::new(DisabledAssistGateway),
            EndpointConfig::default(),
        );
        let server = StreamServer::bind("127.0.0.1:0", context, 1 << 20)
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (manager, url, cancel)
    }

    async fn wait_for_output(events: &mut mpsc::Receiver<ClientEvent>, needle: &str) {
        let mut output = String::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if let ClientEvent::Message(ServerMessage::Output { data }) = event {
                    output.push_str(&data);
                    if output.contains(needle) {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_url_building() {
        let client = StreamClient::new(
            "ws://127.0.0.1:8767",
            "abc-123",
            ReconnectPolicy::default(),
            FakeDirectory::new(true),
        )
        .unwrap();
        assert_eq!(client.url().as_str(), "ws://127.0.0.1:8767/ws/abc-123");
        assert_eq!(client.state(), ClientState::Connecting);

        assert!(matches!(
            StreamClient::new(
                "http://127.0.0.1:8767",
                "abc",
                ReconnectPolicy::default(),
                FakeDirectory::new(true)
            ),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_input_and_detach() {
        let (manager, url, _cancel) = start_server().await;
        let session = manager.create(None).await.unwrap();

        let mut client =
            StreamClient::new(&url, session.id().clone(), fast_policy(3), FakeDirectory::new(true))
                .unwrap();
        let (input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move {
            let result = client.run(input_rx, events_tx).await;
            (result, client.state())
        });

        input_tx
            .send(ClientMessage::Input {
                data: "echo client-$((6*7))\n".to_string(),
            })
            .await
            .unwrap();
        wait_for_output(&mut events_rx, "client-42").await;

        drop(input_tx);
        let (result, state) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state, ClientState::Closed);
        assert!(session.is_live());
    }

    #[tokio::test]
    async fn test_session_end_is_terminal() {
        let (manager, url, _cancel) = start_server().await;
        let session = manager.create(None).await.unwrap();
        let id = session.id().clone();

        let directory = FakeDirectory::new(true);
        let mut client =
            StreamClient::new(&url, id.clone(), fast_policy(3), directory.clone()).unwrap();
        let (_input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move { client.run(input_rx, events_tx).await });

        // Wait for the attach before closing.
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, ClientEvent::Message(ServerMessage::Attached { .. })) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        manager.close(&id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(ClientError::Terminated { code, .. }) => assert_eq!(code, ErrorCode::SessionClosed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    }

    /// Accepts connections; the first `drops` are cut without a close frame,
    /// the next one gets a greeting and a normal close.
    async fn flaky_server(drops: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            for _ in 0..drops {
                let (tcp, _) = listener.accept().await.unwrap();
                let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                drop(ws);
            }
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let greeting = ServerMessage::output("welcome back").to_json().unwrap();
            ws.send(WsMessage::Text(greeting)).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });
        url
    }

    #[tokio::test]
    async fn test_reconnects_after_abnormal_close() {
        let url = flaky_server(2).await;
        let directory = FakeDirectory::new(true);
        let mut client = StreamClient::new(&url, "abc", fast_policy(5), directory.clone()).unwrap();

        let (_input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let result = tokio::time::timeout(Duration::from_secs(10), client.run(input_rx, events_tx))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);

        let mut states = Vec::new();
        let mut retries = Vec::new();
        let mut greeted = false;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                ClientEvent::StateChanged(state) => states.push(state),
                ClientEvent::RetryScheduled { attempt, .. } => retries.push(attempt),
                ClientEvent::Message(ServerMessage::Output { data }) => {
                    greeted = data == "welcome back";
                }
                _ => {}
            }
        }
        assert!(greeted);
        // Each connection that succeeds resets the count.
        assert_eq!(retries, vec![1, 1]);
        assert_eq!(states.first(), Some(&ClientState::Connecting));
        assert!(states.contains(&ClientState::Reconnecting));
        assert_eq!(states.last(), Some(&ClientState::Closed));
    }

    #[tokio::test]
    async fn test_stops_when_session_gone() {
        let url = flaky_server(1).await;
        let directory = FakeDirectory::new(false);
        let mut client = StreamClient::new(&url, "abc", fast_policy(5), directory.clone()).unwrap();

        let (_input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, _events_rx) = mpsc::channel(256);
        let result = tokio::time::timeout(Duration::from_secs(10), client.run(input_rx, events_tx))
            .await
            .unwrap();

        assert!(matches!(result, Err(ClientError::SessionGone(id)) if id == "abc"));
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let directory = FakeDirectory::new(true);
        let mut client = StreamClient::new(&url, "abc", fast_policy(2), directory.clone()).unwrap();
        let (_input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, _events_rx) = mpsc::channel(256);

        let result = tokio::time::timeout(Duration::from_secs(10), client.run(input_rx, events_tx))
            .await
            .unwrap();
        assert!(matches!(result, Err(ClientError::RetriesExhausted { attempts: 2 })));
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        };
        let mut client = StreamClient::new(&url, "abc", policy, FakeDirectory::new(true)).unwrap();
        let cancel = client.cancel_token();
        let (_input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let handle = tokio::spawn(async move { client.run(input_rx, events_tx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events_rx.recv().await {
                if matches!(event, ClientEvent::RetryScheduled { .. }) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
