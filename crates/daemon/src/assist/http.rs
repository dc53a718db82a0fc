//! HTTP assistance gateway.
//!
//! Posts a chat conversation to `{endpoint_url}/api/chat` and reads the
//! reply from the `content` field. Each session keeps a short conversation
//! history so follow-up questions have context.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{AssistError, AssistFuture, AssistGateway, AssistRequest};
use crate::config::AssistConfig;

/// Keep-alive for pooled gateway connections.
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    provider: &'a str,
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(alias = "message")]
    content: Option<String>,
}

/// Gateway that talks to an HTTP model service.
pub struct HttpAssistGateway {
    client: Client,
    config: AssistConfig,
    contexts: DashMap<String, VecDeque<ChatMessage>>,
}

impl HttpAssistGateway {
    /// Builds a gateway from configuration.
    ///
    /// The HTTP client timeout is the configured assist timeout; callers
    /// usually apply their own timeout on top.
    pub fn new(config: AssistConfig) -> Result<Self, AssistError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .build()
            .map_err(|e| AssistError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            contexts: DashMap::new(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.config.endpoint_url.trim_end_matches('/'))
    }

    /// Conversation sent for a new prompt: system prompt, history, prompt.
    fn conversation(&self, session_id: &str, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new("system", &self.config.system_prompt)];
        if let Some(history) = self.contexts.get(session_id) {
            messages.extend(history.iter().cloned());
        }
        messages.push(ChatMessage::new("user", prompt));
        messages
    }

    fn remember(&self, session_id: &str, prompt: String, reply: &str) {
        let limit = self.config.context_messages;
        if limit == 0 {
            return;
        }
        let mut history = self.contexts.entry(session_id.to_string()).or_default();
        history.push_back(ChatMessage::new("user", prompt));
        history.push_back(ChatMessage::new("assistant", reply));
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Number of history messages held for a session.
    pub fn context_len(&self, session_id: &str) -> usize {
        self.contexts.get(session_id).map(|h| h.len()).unwrap_or(0)
    }

    async fn send(&self, session_id: &str, request: &AssistRequest) -> Result<String, AssistError> {
        let prompt = request.prompt();
        let body = ChatRequest {
            provider: &self.config.provider,
            model: &self.config.model,
            messages: self.conversation(session_id, &prompt),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        tracing::debug!(session_id = %session_id, url = %self.chat_url(), "Sending assist request");

        let response = self
            .client
            .post(self.chat_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AssistError::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    AssistError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(session_id = %session_id, status = %status, "Assist gateway error");
            return Err(AssistError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| AssistError::Decode(e.to_string()))?;

        let content = reply
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or(AssistError::EmptyResponse)?;

        self.remember(session_id, prompt, &content);
        Ok(content)
    }
}

impl AssistGateway for HttpAssistGateway {
    fn analyze<'a>(&'a self, session_id: &'a str, request: &'a AssistRequest) -> AssistFuture<'a> {
        Box::pin(self.send(session_id, request))
    }

    fn forget(&self, session_id: &str) {
        if self.contexts.remove(session_id).is_some() {
            tracing::debug!(session_id = %session_id, "Dropped assist context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves one canned HTTP response per accepted connection and reports
    /// each request body.
    async fn fake_gateway(
        status: u16,
        body: &'static str,
    ) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let (header_end, content_length) = loop {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                        let length = headers
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        break (pos + 4, length);
                    }
                };
                while buf.len() < header_end + content_length {
                    let n = stream.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let request: serde_json::Value =
                    serde_json::from_slice(&buf[header_end..header_end + content_length])
                        .unwrap_or(serde_json::Value::Null);
                let _ = tx.send(request);

                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{addr}"), rx)
    }

    fn config(url: String) -> AssistConfig {
        AssistConfig {
            enabled: true,
            endpoint_url: url,
            timeout_secs: 5,
            context_messages: 4,
            ..AssistConfig::default()
        }
    }

    fn command(text: &str) -> AssistRequest {
        AssistRequest::Command {
            command: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_analyze_success() {
        let (url, mut requests) = fake_gateway(200, r#"{"content":"Lists files."}"#).await;
        let gateway = HttpAssistGateway::new(config(url)).unwrap();

        let reply = gateway.analyze("s1", &command("ls")).await.unwrap();
        assert_eq!(reply, "Lists files.");

        let sent = requests.recv().await.unwrap();
        let messages = sent["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(
            messages.last().unwrap()["content"],
            "Please explain this command concisely: ls"
        );
        assert_eq!(sent["stream"], false);
        assert_eq!(gateway.context_len("s1"), 2);
    }

    #[tokio::test]
    async fn test_context_is_per_session_and_bounded() {
        let (url, mut requests) = fake_gateway(200, r#"{"message":"ok"}"#).await;
        let gateway = HttpAssistGateway::new(config(url)).unwrap();

        for i in 0..3 {
            gateway
                .analyze("s1", &command(&format!("cmd{i}")))
                .await
                .unwrap();
            requests.recv().await.unwrap();
        }
        assert_eq!(gateway.context_len("s1"), 4);
        assert_eq!(gateway.context_len("s2"), 0);

        gateway.analyze("s1", &command("next")).await.unwrap();
        let sent = requests.recv().await.unwrap();
        // system + 4 history + prompt
        assert_eq!(sent["messages"].as_array().unwrap().len(), 6);

        gateway.forget("s1");
        assert_eq!(gateway.context_len("s1"), 0);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (url, _requests) = fake_gateway(503, r#"{"error":"overloaded"}"#).await;
        let gateway = HttpAssistGateway::new(config(url)).unwrap();

        let err = gateway.analyze("s1", &command("ls")).await.unwrap_err();
        assert!(matches!(err, AssistError::Http { status: 503, .. }));
        assert_eq!(gateway.context_len("s1"), 0);
    }

    #[tokio::test]
    async fn test_empty_response() {
        let (url, _requests) = fake_gateway(200, r#"{"content":"  "}"#).await;
        let gateway = HttpAssistGateway::new(config(url)).unwrap();

        let err = gateway.analyze("s1", &command("ls")).await.unwrap_err();
        assert!(matches!(err, AssistError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_undecodable_response() {
        let (url, _requests) = fake_gateway(200, "not json").await;
        let gateway = HttpAssistGateway::new(config(url)).unwrap();

        let err = gateway.analyze("s1", &command("ls")).await.unwrap_err();
        assert!(matches!(err, AssistError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let gateway = HttpAssistGateway::new(config(format!("http://{addr}"))).unwrap();
        let err = gateway.analyze("s1", &command("ls")).await.unwrap_err();
        assert!(matches!(err, AssistError::Unavailable(_)));
    }

    #[test]
    fn test_chat_url_trims_slash() {
        let gateway =
            HttpAssistGateway::new(config("http://localhost:8003/".to_string())).unwrap();
        assert_eq!(gateway.chat_url(), "http://localhost:8003/api/chat");
    }
}
