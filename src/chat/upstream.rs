//! Client for the OpenAI-compatible completion endpoint.

use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

const DONE_MARKER: &str = "[DONE]";
const CHAT_NOW_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// One upstream event: the text fragments it carried and whether it ended
/// the completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub fragments: Vec<String>,
    pub stop: bool,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Open a streaming completion. The stream ends after the event carrying
    /// `stop`; a stream that ends without one yields a transport error.
    async fn stream_chat(
        &self,
        model: &str,
        max_tokens: u32,
        messages: &[ChatMessage],
    ) -> Result<EventStream>;

    /// Non-streaming completion with the default model. Returns the raw
    /// upstream response body.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<serde_json::Value>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, input: &str) -> Result<EmbeddingResponse>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub data: Vec<EmbeddingData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<serde_json::Value>,
}

impl EmbeddingResponse {
    pub fn into_vector(self) -> Result<Vec<f32>> {
        self.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Provider("empty embedding".into()))
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    presence_penalty: f64,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> ChatBody<'a> {
    fn new(model: &'a str, max_tokens: u32, messages: &'a [ChatMessage], stream: bool) -> Self {
        Self {
            model,
            max_tokens,
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            messages,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse one `data:` payload. `None` for lines that carry no event.
fn parse_event(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:").unwrap_or(line).trim();
    if !data.starts_with('{') {
        return None;
    }
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "skipping undecodable stream line");
            return None;
        }
    };
    let mut event = StreamEvent::default();
    for choice in chunk.choices {
        event
            .fragments
            .push(choice.delta.content.unwrap_or_default());
        if choice.finish_reason.as_deref() == Some("stop") {
            event.stop = true;
        }
    }
    Some(event)
}

fn is_done(line: &str) -> bool {
    line.strip_prefix("data:")
        .is_some_and(|rest| rest.trim() == DONE_MARKER)
}

/// Reads an upstream error body, preferring its `error` field.
async fn upstream_error(resp: reqwest::Response) -> GatewayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").map(|e| e.to_string()))
        .unwrap_or(body);
    GatewayError::Upstream { status, body }
}

pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
    embedding_model: String,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            default_model: config.default_model.clone(),
            embedding_model: config.embedding_model.clone(),
            timeout: config.request_timeout,
        }
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/{endpoint}", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn stream_chat(
        &self,
        model: &str,
        max_tokens: u32,
        messages: &[ChatMessage],
    ) -> Result<EventStream> {
        let resp = self
            .post("chat/completions")
            .json(&ChatBody::new(model, max_tokens, messages, true))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }

        let stream = try_stream! {
            let mut body = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut stopped = false;

            'read: loop {
                let Some(chunk) = body.next().await else {
                    if !stopped {
                        Err(GatewayError::Transport("upstream stream ended before [DONE]".into()))?;
                    }
                    break 'read;
                };
                let chunk = chunk.map_err(|e| GatewayError::Transport(e.to_string()))?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if is_done(line) {
                        if !stopped {
                            yield StreamEvent { fragments: Vec::new(), stop: true };
                        }
                        break 'read;
                    }
                    if let Some(event) = parse_event(line) {
                        stopped |= event.stop;
                        yield event;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<serde_json::Value> {
        let resp = self
            .post("chat/completions")
            .json(&ChatBody::new(
                &self.default_model,
                CHAT_NOW_MAX_TOKENS,
                messages,
                false,
            ))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        let body: serde_json::Value = resp.json().await?;
        if let Some(err) = body.get("error") {
            return Err(GatewayError::Upstream {
                status: reqwest::StatusCode::OK,
                body: err.to_string(),
            });
        }
        if let Some(usage) = body.get("usage") {
            tracing::info!(usage = %usage, "chat_now token usage");
        }
        Ok(body)
    }
}

#[async_trait]
impl Embedder for HttpCompletionClient {
    async fn embed(&self, input: &str) -> Result<EmbeddingResponse> {
        let resp = self
            .post("embeddings")
            .json(&serde_json::json!({
                "model": self.embedding_model,
                "input": input,
                "encoding_format": "float",
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpCompletionClient {
        HttpCompletionClient::new(
            reqwest::Client::new(),
            &UpstreamConfig {
                base_url: server.uri(),
                api_key: "test-key".into(),
                default_model: "deepseek-v3".into(),
                embedding_model: "text-embedding-v3".into(),
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    fn sse(lines: &[&str]) -> ResponseTemplate {
        let body: String = lines.iter().map(|l| format!("{l}\n\n")).collect();
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    async fn collect(stream: EventStream) -> Vec<Result<StreamEvent>> {
        stream.collect().await
    }

    #[test]
    fn test_parse_event_variants() {
        let event = parse_event(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#).unwrap();
        assert_eq!(event.fragments, vec!["hi".to_string()]);
        assert!(!event.stop);

        let event =
            parse_event(r#"data: {"choices":[{"delta":{"content":"."},"finish_reason":"stop"}]}"#)
                .unwrap();
        assert!(event.stop);

        assert!(parse_event(": keep-alive").is_none());
        assert!(parse_event("data: {not json").is_none());
        assert!(is_done("data: [DONE]"));
        assert!(!is_done("data: {}"));
    }

    #[tokio::test]
    async fn test_stream_chat_yields_fragments_then_stop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "deepseek-v3",
                "max_tokens": 1500,
                "stream": true,
                "temperature": 0.7,
            })))
            .respond_with(sse(&[
                r#"data: {"choices":[{"delta":{"content":"Grav"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"ity"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"."},"finish_reason":"stop"}]}"#,
                "data: [DONE]",
            ]))
            .expect(1)
            .mount(&server)
            .await;

        let stream = client_for(&server)
            .stream_chat("deepseek-v3", 1500, &[ChatMessage::user("Explain gravity")])
            .await
            .unwrap();
        let events: Vec<StreamEvent> = collect(stream)
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        let text: String = events.iter().flat_map(|e| e.fragments.clone()).collect();
        assert_eq!(text, "Gravity.");
        assert!(events[2].stop);
    }

    #[tokio::test]
    async fn test_done_without_stop_synthesizes_stop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[
                r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#,
                "data: [DONE]",
            ]))
            .mount(&server)
            .await;

        let stream = client_for(&server)
            .stream_chat("m", 10, &[ChatMessage::user("x")])
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        let last = events[1].as_ref().unwrap();
        assert!(last.stop);
        assert!(last.fragments.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(&[r#"data: {"choices":[{"delta":{"content":"cut"}}]}"#]))
            .mount(&server)
            .await;

        let stream = client_for(&server)
            .stream_chat("m", 10, &[ChatMessage::user("x")])
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(GatewayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_stream_init_failure_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})),
            )
            .mount(&server)
            .await;

        let err = match client_for(&server)
            .stream_chat("m", 10, &[ChatMessage::user("x")])
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        match err {
            GatewayError::Upstream { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_complete_uses_default_model_without_stream_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": "deepseek-v3", "max_tokens": 2000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "a joke"}}],
                "usage": {"total_tokens": 9}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let body = client_for(&server)
            .complete(&[ChatMessage::user("tell me a joke")])
            .await
            .unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "a joke");
        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(sent.get("stream").is_none());
    }

    #[tokio::test]
    async fn test_complete_error_field_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "quota"})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_embed_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({
                "model": "text-embedding-v3",
                "input": "gravity",
                "encoding_format": "float"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "text-embedding-v3",
                "data": [{"index": 0, "embedding": [0.25, -0.5]}]
            })))
            .mount(&server)
            .await;

        let rsp = client_for(&server).embed("gravity").await.unwrap();
        assert_eq!(rsp.clone().into_vector().unwrap(), vec![0.25, -0.5]);
        assert!(EmbeddingResponse::default().into_vector().is_err());
    }
}
