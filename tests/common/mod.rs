//! Shared harness: a full service on a random port with a stub completion
//! service behind it.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use lumi_backend::api::{assemble, build_router};
use lumi_backend::config::AppConfig;
use lumi_backend::error::LlmError;
use lumi_backend::llm::{CompletionRequest, CompletionService, DeltaStream};
use lumi_backend::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const ADMIN_TOKEN: &str = "admin-secret";

/// Scripted completion service.
pub struct StubLlm {
    /// Whole reply, or the HTTP status to fail with.
    pub reply: Result<String, u16>,
    pub deltas: Vec<&'static str>,
    /// Keep the stream open after the deltas instead of ending it.
    pub hang: bool,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl StubLlm {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            deltas: Vec::new(),
            hang: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            reply: Err(status),
            ..Self::replying("")
        }
    }

    pub fn streaming(deltas: Vec<&'static str>, hang: bool) -> Self {
        Self {
            deltas,
            hang,
            ..Self::replying("")
        }
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CompletionService for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.reply.clone().map_err(|status| LlmError::HttpStatus {
            provider: "stub".to_string(),
            status,
            body: "internal error".to_string(),
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<DeltaStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let items: Vec<Result<String, LlmError>> =
            self.deltas.iter().map(|d| Ok(d.to_string())).collect();
        if self.hang {
            Ok(Box::pin(stream::iter(items).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(items)))
        }
    }
}

pub struct TestServer {
    pub base: String,
    pub port: u16,
    pub db: Arc<LibSqlBackend>,
    pub llm: Arc<StubLlm>,
    pub http: reqwest::Client,
}

/// Start the full service on a random port.
pub async fn start_server(llm: StubLlm) -> TestServer {
    let config = AppConfig {
        allow_dev_bypass: true,
        admin_token: Some(secrecy::SecretString::from(ADMIN_TOKEN.to_string())),
        ..AppConfig::default()
    };
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let llm = Arc::new(llm);
    let service = assemble(&config, db.clone(), llm.clone()).unwrap();
    let app = build_router(service.state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        port,
        db,
        llm,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    /// Invoke a callable as `uid` (or anonymously) and return status + body.
    pub async fn call(&self, uid: Option<&str>, name: &str, body: Value) -> (u16, Value) {
        let mut request = self
            .http
            .post(format!("{}/callable/{name}", self.base))
            .json(&body);
        if let Some(uid) = uid {
            request = request.header("x-lumi-uid", uid);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    pub async fn get(&self, uid: &str, path: &str) -> (u16, Value) {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .header("x-lumi-uid", uid)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    pub async fn post(&self, uid: &str, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .header("x-lumi-uid", uid)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    /// Publish the three-step onboarding form used across tests.
    pub async fn publish_form(&self, form_id: &str) {
        let (status, body) = self
            .call(
                None,
                "upsertForm",
                json!({
                    "formId": form_id,
                    "__devBypass": true,
                    "form": {
                        "version": 1,
                        "title": "Welcome to Lumi",
                        "locales": ["en"],
                        "steps": [
                            {"id": "intro", "type": "intro", "title": "Hi!"},
                            {"id": "choiceA", "type": "choice", "required": true,
                             "question": "How old are you?",
                             "options": [
                                {"value": "18-24", "label": "18-24"},
                                {"value": "25-34", "label": "25-34"}
                             ],
                             "writeTo": "profile.age_bracket"},
                            {"id": "finish", "type": "finish"}
                        ]
                    }
                }),
            )
            .await;
        assert_eq!(status, 200, "upsertForm failed: {body}");
    }

    pub async fn set_persona(&self, uid: &str) {
        let (status, body) = self
            .call(
                Some(uid),
                "upsertPersona",
                json!({"mbti": "ENFP", "basePrompt": "Loves hiking and has three cats"}),
            )
            .await;
        assert_eq!(status, 200, "upsertPersona failed: {body}");
    }

    pub async fn messages(&self, uid: &str, chat_id: &str) -> Vec<Value> {
        let (status, body) = self.get(uid, &format!("/api/chats/{chat_id}/messages")).await;
        assert_eq!(status, 200, "list messages failed: {body}");
        body.as_array().cloned().unwrap_or_default()
    }

    /// Poll until the chat holds `count` messages.
    pub async fn wait_for_messages(&self, uid: &str, chat_id: &str, count: usize) -> Vec<Value> {
        loop {
            let messages = self.messages(uid, chat_id).await;
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn session(&self, chat_id: &str) -> lumi_backend::chat::Session {
        self.db.get_session(chat_id).await.unwrap().unwrap()
    }
}
