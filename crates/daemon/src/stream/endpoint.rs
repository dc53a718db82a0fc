//! Per-connection message loop.
//!
//! A connection attaches to one session, then multiplexes four event
//! sources until it ends: session output, client frames, the ping timer and
//! finished assist requests. Output is forwarded in production order; when
//! the connection falls behind, its queue drops new chunks and the client is
//! told how many were lost at the point of the gap, right before the first
//! chunk that follows it.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ErrorCode, ServerMessage, StreamTarget};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

use super::StreamContext;
use crate::assist::{AssistError, AssistRequest, EMPTY_QUERY_REPLY};
use crate::session::{Attachment, OutputChunk, Session, SessionError, SessionManager};

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The client closed the transport.
    ClientClosed,
    /// The transport failed.
    TransportError,
    /// The session ended; the client got a terminal error.
    SessionEnded,
    /// The session could not be created or found.
    AttachFailed,
}

/// A finished assist request, tagged with the request it answers.
struct AssistOutcome {
    seq: u64,
    reply: ServerMessage,
}

struct Connection<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    session: Arc<Session>,
    ctx: StreamContext,
    assist_seq: u64,
    assist_task: Option<JoinHandle<()>>,
    assist_tx: mpsc::UnboundedSender<AssistOutcome>,
}

/// Drives one connection to completion.
pub async fn handle_connection<S>(
    ws: WebSocketStream<S>,
    target: StreamTarget,
    ctx: StreamContext,
) -> Disconnect
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();

    let Attachment {
        session,
        scrollback,
        mut subscription,
    } = match attach(&ctx, target).await {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::info!(error = %e, "Stream attach failed");
            let message = ServerMessage::error(e.code(), e.user_message());
            if let Ok(json) = message.to_json() {
                let _ = sink.send(WsMessage::Text(json)).await;
            }
            let _ = sink.send(close_frame("attach failed")).await;
            return Disconnect::AttachFailed;
        }
    };

    tracing::info!(session_id = %session.id(), "Connection attached");

    let (assist_tx, mut assist_rx) = mpsc::unbounded_channel();
    let mut conn = Connection {
        sink,
        session,
        ctx,
        assist_seq: 0,
        assist_task: None,
        assist_tx,
    };

    let period = conn.ctx.config.ping_interval;
    let mut ping = interval_at(Instant::now() + period, period);

    let greeting = conn.send_greeting(scrollback).await;
    let reason = if let Err(e) = greeting {
        transport_error(&conn.session, e)
    } else {
        loop {
            tokio::select! {
                chunk = subscription.recv() => {
                    let Some(chunk) = chunk else {
                        conn.send_session_ended().await;
                        break Disconnect::SessionEnded;
                    };
                    if let Err(e) = conn.forward_output(chunk).await {
                        break transport_error(&conn.session, e);
                    }
                }
                frame = stream.next() => {
                    let result = match frame {
                        Some(Ok(WsMessage::Text(text))) => conn.handle_text(&text).await,
                        Some(Ok(WsMessage::Binary(data))) => conn.handle_input(&data).await,
                        Some(Ok(WsMessage::Close(_))) | None => break Disconnect::ClientClosed,
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => Err(e),
                    };
                    if let Err(e) = result {
                        break transport_error(&conn.session, e);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = conn.sink.send(WsMessage::Ping(Vec::new())).await {
                        break transport_error(&conn.session, e);
                    }
                }
                Some(outcome) = assist_rx.recv() => {
                    if let Err(e) = conn.deliver_assist(outcome).await {
                        break transport_error(&conn.session, e);
                    }
                }
            }
        }
    };

    if let Some(task) = conn.assist_task.take() {
        task.abort();
    }
    conn.session.unsubscribe(&subscription);
    let _ = conn.sink.close().await;

    tracing::info!(session_id = %conn.session.id(), reason = ?reason, "Connection closed");
    reason
}

async fn attach(ctx: &StreamContext, target: StreamTarget) -> Result<Attachment, SessionError> {
    let capacity = ctx.config.output_buffer_chunks;
    match target {
        StreamTarget::New => {
            let session = ctx.manager.create(None).await?;
            ctx.manager.attach(session.id(), capacity)
        }
        StreamTarget::Existing(id) => ctx.manager.attach(&id, capacity),
    }
}

fn transport_error(session: &Session, error: WsError) -> Disconnect {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Disconnect::ClientClosed,
        other => {
            tracing::debug!(session_id = %session.id(), error = %other, "Stream transport error");
            Disconnect::TransportError
        }
    }
}

fn close_frame(reason: &'static str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: reason.into(),
    }))
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: &ServerMessage) -> Result<(), WsError> {
        match message.to_json() {
            Ok(json) => self.sink.send(WsMessage::Text(json)).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode server message");
                Ok(())
            }
        }
    }

    async fn send_greeting(&mut self, scrollback: String) -> Result<(), WsError> {
        let (rows, cols) = self.session.geometry();
        let attached = ServerMessage::Attached {
            session_id: self.session.id().clone(),
            rows,
            cols,
        };
        self.send(&attached).await?;
        if !scrollback.is_empty() {
            self.send(&ServerMessage::output(scrollback)).await?;
        }
        Ok(())
    }

    async fn forward_output(&mut self, chunk: OutputChunk) -> Result<(), WsError> {
        let dropped = chunk.dropped_before;
        if dropped > 0 {
            let notice = ServerMessage::error(
                ErrorCode::OutputOverflow,
                format!("Connection fell behind; {dropped} output chunks were dropped."),
            );
            self.send(&notice).await?;
        }
        let text = String::from_utf8_lossy(&chunk.data).into_owned();
        self.send(&ServerMessage::output(text)).await
    }

    async fn send_session_ended(&mut self) {
        let message = match self.session.close_reason() {
            Some(reason) => format!("Session {} has ended: {}.", self.session.id(), reason),
            None => format!("Session {} has ended.", self.session.id()),
        };
        let _ = self
            .send(&ServerMessage::error(ErrorCode::SessionClosed, message))
            .await;
        let _ = self.sink.send(close_frame("session closed")).await;
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), WsError> {
        match ClientMessage::from_json(text) {
            Ok(ClientMessage::Input { data }) => self.handle_input(data.as_bytes()).await,
            Ok(ClientMessage::Resize { rows, cols }) => match self.session.resize(rows, cols) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.send(&ServerMessage::error(e.code(), e.user_message()))
                        .await
                }
            },
            Ok(ClientMessage::Assist {
                query,
                is_output_analysis,
            }) => self.start_assist(&query, is_output_analysis).await,
            Err(e) => {
                tracing::debug!(session_id = %self.session.id(), error = %e, "Rejected client message");
                self.send(&ServerMessage::error(ErrorCode::from(&e), e.to_string()))
                    .await
            }
        }
    }

    async fn handle_input(&mut self, data: &[u8]) -> Result<(), WsError> {
        match self.session.write_input(data) {
            Ok(_) => Ok(()),
            // The output stream ends next and carries the terminal error.
            Err(SessionError::Closed(_)) => {
                tracing::debug!(session_id = %self.session.id(), "Input after session close");
                Ok(())
            }
            Err(e) => {
                self.send(&ServerMessage::error(e.code(), e.user_message()))
                    .await
            }
        }
    }

    async fn start_assist(&mut self, query: &str, is_output_analysis: bool) -> Result<(), WsError> {
        self.assist_seq += 1;
        if let Some(previous) = self.assist_task.take() {
            previous.abort();
        }
        self.send(&ServerMessage::assist_loading()).await?;

        let Some(request) = AssistRequest::from_query(query, is_output_analysis) else {
            return self.send(&ServerMessage::assist_reply(EMPTY_QUERY_REPLY)).await;
        };

        let seq = self.assist_seq;
        let gateway = Arc::clone(&self.ctx.gateway);
        let session_id = self.session.id().clone();
        let timeout = self.ctx.config.assist_timeout;
        let tx = self.assist_tx.clone();

        self.assist_task = Some(tokio::spawn(async move {
            let reply =
                match tokio::time::timeout(timeout, gateway.analyze(&session_id, &request)).await {
                    Ok(Ok(content)) => ServerMessage::assist_reply(content),
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Assist request failed");
                        ServerMessage::assist_error(e.user_message())
                    }
                    Err(_) => {
                        tracing::warn!(session_id = %session_id, "Assist request timed out");
                        ServerMessage::assist_error(AssistError::Timeout(timeout).user_message())
                    }
                };
            let _ = tx.send(AssistOutcome { seq, reply });
        }));
        Ok(())
    }

    async fn deliver_assist(&mut self, outcome: AssistOutcome) -> Result<(), WsError> {
        if outcome.seq != self.assist_seq {
            tracing::debug!(
                session_id = %self.session.id(),
                seq = outcome.seq,
                "Discarding superseded assist reply"
            );
            return Ok(());
        }
        self.assist_task = None;
        self.send(&outcome.reply).await
    }
}
