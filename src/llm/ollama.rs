//! Ollama `/api/chat` client.
//!
//! Whole replies are requested with `stream: false` and read from either the
//! native `message.content` shape or the OpenAI-style `choices[0]` shape.
//! Streaming replies arrive as newline-delimited JSON objects and are decoded
//! by [`NdjsonDecoder`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{
    ChatMessage, CompletionRequest, CompletionService, DeltaStream, GenerationOptions,
    NO_REPLY_PLACEHOLDER,
};
use crate::config::AppConfig;
use crate::error::LlmError;

const PROVIDER: &str = "ollama";

/// Buffered deltas between the reader task and the consumer.
const STREAM_BUFFER: usize = 32;

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    reply_timeout: Duration,
    stream_timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a GenerationOptions>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            reply_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(90),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut client = Self::new(&config.ollama_base_url, &config.model)
            .with_timeouts(config.reply_timeout, config.stream_timeout);
        client.api_key = config.ollama_api_key.clone();
        client
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_timeouts(mut self, reply: Duration, stream: Duration) -> Self {
        self.reply_timeout = reply;
        self.stream_timeout = stream;
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
        timeout: Duration,
    ) -> Result<reqwest::Response, LlmError> {
        let body = ChatRequestBody {
            model: &self.model,
            messages: &request.messages,
            stream,
            keep_alive: request.keep_alive.as_deref(),
            options: request.options.as_ref(),
        };

        let mut builder = self.client.post(self.chat_url()).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        debug!(
            model = %self.model,
            stream,
            messages = request.messages.len(),
            "Sending chat request"
        );
        let response = builder.send().await.map_err(|e| transport_error(e, timeout))?;
        ensure_success(response).await
    }
}

fn transport_error(e: reqwest::Error, after: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            provider: PROVIDER.to_string(),
            after,
        }
    } else {
        LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        }
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(LlmError::HttpStatus {
        provider: PROVIDER.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Reply text of a non-streaming response: a non-empty `message.content`,
/// else a non-empty `choices[0].message.content`.
pub fn extract_reply(body: &Value) -> Option<&str> {
    let native = body
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str);
    let openai = || {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
    };
    native
        .filter(|s| !s.is_empty())
        .or_else(|| openai().filter(|s| !s.is_empty()))
}

fn upstream_error(body: &Value) -> Option<&str> {
    body.get("error").and_then(Value::as_str)
}

#[async_trait]
impl CompletionService for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let response = self.send(request, false, self.reply_timeout).await?;
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.reply_timeout))?;
        let body: Value = serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("body is not JSON: {e}"),
        })?;

        if let Some(reply) = extract_reply(&body) {
            return Ok(reply.to_string());
        }
        if let Some(message) = upstream_error(&body) {
            return Err(LlmError::Upstream {
                provider: PROVIDER.to_string(),
                message: message.to_string(),
            });
        }
        warn!(model = %self.model, "Response carried no reply text");
        Ok(NO_REPLY_PLACEHOLDER.to_string())
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError> {
        let timeout = self.stream_timeout;
        let response = self.send(request, true, timeout).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = NdjsonDecoder::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(transport_error(e, timeout))).await;
                        return;
                    }
                };
                for event in decoder.push(&chunk) {
                    if !forward(&tx, event).await {
                        return;
                    }
                }
            }
            for event in decoder.finish() {
                if !forward(&tx, event).await {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Hand one decoded event to the consumer. Returns false once the stream
/// is over, either because it ended or because the consumer went away.
async fn forward(tx: &mpsc::Sender<Result<String, LlmError>>, event: NdjsonEvent) -> bool {
    match event {
        NdjsonEvent::Delta(text) => tx.send(Ok(text)).await.is_ok(),
        NdjsonEvent::Done => false,
        NdjsonEvent::Error(message) => {
            let _ = tx
                .send(Err(LlmError::Upstream {
                    provider: PROVIDER.to_string(),
                    message,
                }))
                .await;
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdjsonEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Incremental decoder for a newline-delimited JSON chat stream.
///
/// Lines may be split across network chunks. Blank lines and lines that are
/// not JSON are skipped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed a chunk and return the events of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<NdjsonEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            decode_line(&line, &mut events);
        }
        events
    }

    /// Decode whatever is left after the body ended without a newline.
    pub fn finish(&mut self) -> Vec<NdjsonEvent> {
        let line = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        decode_line(&line, &mut events);
        events
    }
}

fn decode_line(line: &[u8], events: &mut Vec<NdjsonEvent>) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Skipping undecodable stream line");
            return;
        }
    };

    if let Some(message) = upstream_error(&value) {
        events.push(NdjsonEvent::Error(message.to_string()));
        return;
    }
    if let Some(delta) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        events.push(NdjsonEvent::Delta(delta.to_string()));
    }
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        events.push(NdjsonEvent::Done);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_prefers_native_shape() {
        let body = json!({
            "message": {"content": "native"},
            "choices": [{"message": {"content": "openai"}}]
        });
        assert_eq!(extract_reply(&body), Some("native"));
    }

    #[test]
    fn extract_falls_back_on_empty_native_content() {
        let body = json!({
            "message": {"content": ""},
            "choices": [{"message": {"content": "openai"}}]
        });
        assert_eq!(extract_reply(&body), Some("openai"));
        assert_eq!(extract_reply(&json!({"message": {"content": ""}})), None);
        assert_eq!(extract_reply(&json!({"done": true})), None);
    }

    #[test]
    fn request_body_omits_unset_fields() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatRequestBody {
            model: "m",
            messages: &messages,
            stream: false,
            keep_alive: None,
            options: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}], "stream": false})
        );
    }

    #[test]
    fn decoder_joins_lines_split_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"message":{"content":"Hel"#).is_empty());
        assert_eq!(
            decoder.push(b"lo\"}}\n{\"message\":{\"content\":\"!\"}}\n"),
            vec![
                NdjsonEvent::Delta("Hello".to_string()),
                NdjsonEvent::Delta("!".to_string())
            ]
        );
    }

    #[test]
    fn decoder_skips_blank_and_garbage_lines() {
        let mut decoder = NdjsonDecoder::default();
        let events = decoder.push(b"\n  \nnot json\n{\"message\":{\"content\":\"\"}}\n{\"message\":{\"content\":\"a\"}}\n");
        assert_eq!(events, vec![NdjsonEvent::Delta("a".to_string())]);
    }

    #[test]
    fn decoder_reports_final_delta_before_done() {
        let mut decoder = NdjsonDecoder::default();
        let events = decoder.push(b"{\"message\":{\"content\":\"end\"},\"done\":true}\n");
        assert_eq!(
            events,
            vec![NdjsonEvent::Delta("end".to_string()), NdjsonEvent::Done]
        );
    }

    #[test]
    fn decoder_surfaces_error_lines() {
        let mut decoder = NdjsonDecoder::default();
        let events = decoder.push(b"{\"error\":\"model not found\"}\n");
        assert_eq!(events, vec![NdjsonEvent::Error("model not found".to_string())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(b"{\"done\":true}").is_empty());
        assert_eq!(decoder.finish(), vec![NdjsonEvent::Done]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/", "m");
        assert_eq!(client.chat_url(), "http://localhost:11434/api/chat");
        assert_eq!(client.model_name(), "m");
    }
}
