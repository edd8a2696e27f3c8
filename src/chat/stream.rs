//! Direct streaming replies.
//!
//! A turn stores the user's message, streams the assistant reply while
//! relaying deltas, and persists what the stream left behind once it ends:
//!
//! | outcome                     | stored message                    |
//! |-----------------------------|-----------------------------------|
//! | completed                   | full text, `sent`                 |
//! | cancelled after some text   | partial text, `sent`              |
//! | cancelled before any text   | nothing                           |
//! | failed after some text      | [`STREAM_FAILURE_NOTICE`], `error`|
//! | failed before any text      | nothing                           |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use super::model::{Message, MessageStatus, NewMessage, Session};
use super::reply::{DEFAULT_HISTORY_LIMIT, conversation};
use crate::error::{Error, LlmError};
use crate::llm::{CompletionRequest, CompletionService, DeltaStream};
use crate::persona::StrictConfigCache;
use crate::store::Database;

/// Text stored in place of a partial reply whose stream broke.
pub const STREAM_FAILURE_NOTICE: &str = "(Connection failed, please try again later.)";

/// Cooperative cancellation flag shared between a turn and its owner.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// How a stream ended.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed { text: String },
    Cancelled { partial: String },
    Failed { partial: String, error: LlmError },
}

impl StreamOutcome {
    /// The assistant message this outcome leaves behind, if any.
    pub fn artifact(&self) -> Option<NewMessage> {
        match self {
            Self::Completed { text } | Self::Cancelled { partial: text } if !text.is_empty() => {
                Some(NewMessage::assistant(text.clone(), MessageStatus::Sent))
            }
            Self::Failed { partial, .. } if !partial.is_empty() => Some(NewMessage::assistant(
                STREAM_FAILURE_NOTICE,
                MessageStatus::Error,
            )),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Drain `stream`, handing every delta to `on_delta` and accumulating the
/// text. Cancellation is observed between deltas; a delta that arrives after
/// cancellation is discarded.
pub async fn consume(
    mut stream: DeltaStream,
    cancel: &CancelToken,
    mut on_delta: impl FnMut(&str),
) -> StreamOutcome {
    let mut text = String::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled { partial: text },
            item = stream.next() => match item {
                None => return StreamOutcome::Completed { text },
                Some(Ok(delta)) => {
                    if cancel.is_cancelled() {
                        return StreamOutcome::Cancelled { partial: text };
                    }
                    text.push_str(&delta);
                    on_delta(&delta);
                }
                Some(Err(error)) => return StreamOutcome::Failed { partial: text, error },
            },
        }
    }
}

/// Result of one streamed turn.
#[derive(Debug)]
pub struct TurnResult {
    pub user_message: Message,
    pub outcome: StreamOutcome,
    /// The assistant message persisted for this turn, if any.
    pub stored: Option<Message>,
}

/// Runs streamed turns against a user-AI session.
pub struct DirectStreamer {
    db: Arc<dyn Database>,
    llm: Arc<dyn CompletionService>,
    prompts: Arc<StrictConfigCache>,
    history_limit: usize,
}

impl DirectStreamer {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn CompletionService>,
        prompts: Arc<StrictConfigCache>,
    ) -> Self {
        Self {
            db,
            llm,
            prompts,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Store `text` as `uid`'s message, then stream the reply. Deltas go to
    /// `deltas` as they arrive. The user message does not fire the reply
    /// trigger; this turn is the reply.
    pub async fn run_turn(
        &self,
        session: &Session,
        uid: &str,
        text: &str,
        cancel: &CancelToken,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<TurnResult, Error> {
        let user_message = self
            .db
            .append_message(&session.id, &NewMessage::user(uid, text))
            .await?
            .message;

        let outcome = if cancel.is_cancelled() {
            StreamOutcome::Cancelled {
                partial: String::new(),
            }
        } else {
            let history: Vec<Message> = self
                .db
                .recent_messages(&session.id, self.history_limit, Some(user_message.created_at))
                .await?
                .into_iter()
                .filter(|m| m.status == MessageStatus::Sent)
                .collect();
            let system = self.prompts.system_prompt(&session.persona()).await;
            let request = CompletionRequest::interactive(conversation(&system.text, &history));
            debug!(chat_id = %session.id, history = history.len(), "Starting reply stream");

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                opened = self.llm.stream(&request) => Some(opened),
            };
            match opened {
                None => StreamOutcome::Cancelled {
                    partial: String::new(),
                },
                Some(Ok(stream)) => {
                    consume(stream, cancel, |delta| {
                        let _ = deltas.send(delta.to_string());
                    })
                    .await
                }
                Some(Err(error)) => StreamOutcome::Failed {
                    partial: String::new(),
                    error,
                },
            }
        };

        if let StreamOutcome::Failed { error, .. } = &outcome {
            warn!(chat_id = %session.id, error = %error, "Reply stream failed");
        }

        let stored = match outcome.artifact() {
            Some(artifact) => {
                let message = self.db.append_message(&session.id, &artifact).await?.message;
                if message.status == MessageStatus::Sent {
                    self.db.touch_session(&session.id, message.created_at).await?;
                }
                Some(message)
            }
            None => None,
        };
        info!(
            chat_id = %session.id,
            outcome = outcome.kind(),
            stored = stored.is_some(),
            "Reply stream finished"
        );

        Ok(TurnResult {
            user_message,
            outcome,
            stored,
        })
    }
}
