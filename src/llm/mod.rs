//! Text completion service integration.
//!
//! The [`CompletionService`] trait is the seam between the chat pipeline and
//! the external model server. [`OllamaClient`] speaks the Ollama
//! `/api/chat` contract over `reqwest`.

pub mod ollama;

pub use ollama::{NdjsonDecoder, NdjsonEvent, OllamaClient, extract_reply};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Reply text used when a response carries no recognizable content.
pub const NO_REPLY_PLACEHOLDER: &str = "(no reply)";

/// Incremental text fragments of a streaming completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling and runtime options forwarded to the model server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub num_predict: u32,
    pub num_thread: u32,
    pub num_ctx: u32,
    pub num_keep: u32,
    pub num_batch: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for GenerationOptions {
    /// Tuned for short chat turns on a CPU-only host.
    fn default() -> Self {
        Self {
            num_predict: 120,
            num_thread: 4,
            num_ctx: 1536,
            num_keep: 128,
            num_batch: 64,
            stop: vec!["\n\n".to_string(), "User:".to_string(), "使用者：".to_string()],
        }
    }
}

/// Keep-alive sent with streaming requests.
pub const STREAM_KEEP_ALIVE: &str = "30m";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub keep_alive: Option<String>,
    pub options: Option<GenerationOptions>,
}

impl CompletionRequest {
    /// A plain request with server-side defaults.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            keep_alive: None,
            options: None,
        }
    }

    /// A request with the interactive streaming settings.
    pub fn interactive(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            keep_alive: Some(STREAM_KEEP_ALIVE.to_string()),
            options: Some(GenerationOptions::default()),
        }
    }
}

/// External text completion service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;

    /// Request a whole reply at once.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// Request a reply as a stream of text deltas. The stream ends after the
    /// final delta; dropping it abandons the request.
    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted completion service for unit tests.

    use std::sync::Mutex;

    use futures::{StreamExt, stream};

    use super::*;

    pub(crate) enum Script {
        Reply(String),
        /// Replies only after the delay.
        Delayed(std::time::Duration, String),
        Fail(u16),
        Deltas(Vec<&'static str>),
        /// Yields the deltas, then never finishes.
        DeltasThenHang(Vec<&'static str>),
        /// Yields the deltas, then an upstream error.
        DeltasThenFail(Vec<&'static str>),
    }

    pub(crate) struct ScriptedCompletion {
        script: Script,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompletion {
        pub(crate) fn new(script: Script) -> Self {
            Self {
                script,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn last_request(&self) -> CompletionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn upstream(message: &str) -> LlmError {
        LlmError::Upstream {
            provider: "scripted".to_string(),
            message: message.to_string(),
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            match &self.script {
                Script::Reply(text) => Ok(text.clone()),
                Script::Delayed(delay, text) => {
                    tokio::time::sleep(*delay).await;
                    Ok(text.clone())
                }
                Script::Fail(status) => Err(LlmError::HttpStatus {
                    provider: "scripted".to_string(),
                    status: *status,
                    body: "boom".to_string(),
                }),
                _ => Err(upstream("complete not scripted")),
            }
        }

        async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let items = |deltas: &Vec<&'static str>| -> Vec<Result<String, LlmError>> {
                deltas.iter().map(|d| Ok(d.to_string())).collect()
            };
            match &self.script {
                Script::Deltas(deltas) => Ok(Box::pin(stream::iter(items(deltas)))),
                Script::DeltasThenHang(deltas) => {
                    Ok(Box::pin(stream::iter(items(deltas)).chain(stream::pending())))
                }
                Script::DeltasThenFail(deltas) => Ok(Box::pin(
                    stream::iter(items(deltas)).chain(stream::once(async { Err(upstream("lost")) })),
                )),
                Script::Fail(status) => Err(LlmError::HttpStatus {
                    provider: "scripted".to_string(),
                    status: *status,
                    body: "boom".to_string(),
                }),
                Script::Reply(_) | Script::Delayed(..) => Err(upstream("stream not scripted")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_options_match_wire_names() {
        let value = serde_json::to_value(GenerationOptions::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "num_predict": 120,
                "num_thread": 4,
                "num_ctx": 1536,
                "num_keep": 128,
                "num_batch": 64,
                "stop": ["\n\n", "User:", "使用者："]
            })
        );
    }

    #[test]
    fn interactive_request_carries_keep_alive() {
        let req = CompletionRequest::interactive(vec![ChatMessage::user("hi")]);
        assert_eq!(req.keep_alive.as_deref(), Some("30m"));
        assert!(req.options.is_some());
        assert!(CompletionRequest::new(vec![]).options.is_none());
    }

    #[test]
    fn roles_serialize_lowercase() {
        assert_eq!(
            serde_json::to_value(ChatMessage::system("rules")).unwrap(),
            json!({"role": "system", "content": "rules"})
        );
    }
}
