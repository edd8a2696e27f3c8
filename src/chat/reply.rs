//! Assistant replies to user messages in user-AI sessions.
//!
//! One execution per user message: re-read the session, build a bounded
//! history, compose the system prompt from the session's persona snapshot,
//! call the completion service and write back exactly one assistant message.
//! Failures become a visible `error` message instead of propagating.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::model::{Message, MessageStatus, NewMessage, Role, Session, SessionKind, reply_key};
use crate::error::{Error, LlmError};
use crate::llm::{ChatMessage, CompletionRequest, CompletionService};
use crate::persona::StrictConfigCache;
use crate::store::Database;

/// Text of the assistant message written when a reply could not be produced.
pub const REPLY_ERROR_TEXT: &str = "(AI failed to respond. Please try again.)";

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// What a single orchestrator run did.
#[derive(Debug, Clone)]
pub enum ReplyOutcome {
    Replied(Message),
    /// The completion failed and the error message was written.
    Failed(Message),
    /// A reply to this message already exists.
    AlreadyReplied(Message),
    Skipped(SkipReason),
    /// The store could not be read or written; nothing was appended.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SessionMissing,
    NotUserAi,
    MessageMissing,
    NotUserMessage,
}

/// Prompt messages for one turn: the system prompt, then the history
/// oldest first.
pub fn conversation(system_prompt: &str, history: &[Message]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(history.iter().map(|m| match m.role {
        Role::User => ChatMessage::user(&m.text),
        Role::Assistant => ChatMessage::assistant(&m.text),
    }));
    messages
}

pub struct ReplyOrchestrator {
    db: Arc<dyn Database>,
    llm: Arc<dyn CompletionService>,
    prompts: Arc<StrictConfigCache>,
    history_limit: usize,
    reply_timeout: Duration,
}

impl ReplyOrchestrator {
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
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// React to the creation of message `message_id` in `chat_id`.
    pub async fn handle(&self, chat_id: &str, message_id: &str) -> ReplyOutcome {
        let session = match self.db.get_session(chat_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return ReplyOutcome::Skipped(SkipReason::SessionMissing),
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "Failed to load session for reply");
                return ReplyOutcome::Aborted;
            }
        };
        if session.kind != SessionKind::UserAi {
            return ReplyOutcome::Skipped(SkipReason::NotUserAi);
        }

        let trigger = match self.db.get_message(chat_id, message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => return ReplyOutcome::Skipped(SkipReason::MessageMissing),
            Err(e) => {
                error!(chat_id = %chat_id, message_id = %message_id, error = %e, "Failed to load triggering message");
                return ReplyOutcome::Aborted;
            }
        };
        if trigger.role != Role::User {
            return ReplyOutcome::Skipped(SkipReason::NotUserMessage);
        }

        let key = reply_key(&trigger.id);
        match self.db.find_message_by_key(chat_id, &key).await {
            Ok(Some(existing)) => {
                debug!(chat_id = %chat_id, message_id = %message_id, "Reply already written");
                return ReplyOutcome::AlreadyReplied(existing);
            }
            Ok(None) => {}
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "Failed to check for an existing reply");
                return ReplyOutcome::Aborted;
            }
        }

        match self.generate(&session, &trigger).await {
            Ok(text) => {
                let reply = NewMessage::assistant(text, MessageStatus::Sent).with_idempotency_key(&key);
                let appended = match self.db.append_message(chat_id, &reply).await {
                    Ok(appended) => appended,
                    Err(e) => {
                        error!(chat_id = %chat_id, error = %e, "Failed to store reply");
                        return ReplyOutcome::Aborted;
                    }
                };
                if !appended.created {
                    return ReplyOutcome::AlreadyReplied(appended.message);
                }
                if let Err(e) = self
                    .db
                    .touch_session(chat_id, appended.message.created_at)
                    .await
                {
                    warn!(chat_id = %chat_id, error = %e, "Failed to bump lastMessageAt");
                }
                info!(chat_id = %chat_id, message_id = %message_id, "Reply written");
                ReplyOutcome::Replied(appended.message)
            }
            Err(e) => {
                warn!(chat_id = %chat_id, message_id = %message_id, error = %e, "Reply generation failed");
                let notice = NewMessage::assistant(REPLY_ERROR_TEXT, MessageStatus::Error)
                    .with_idempotency_key(&key);
                match self.db.append_message(chat_id, &notice).await {
                    Ok(appended) if appended.created => ReplyOutcome::Failed(appended.message),
                    Ok(appended) => ReplyOutcome::AlreadyReplied(appended.message),
                    Err(e) => {
                        error!(chat_id = %chat_id, error = %e, "Failed to store reply error");
                        ReplyOutcome::Aborted
                    }
                }
            }
        }
    }

    async fn generate(&self, session: &Session, trigger: &Message) -> Result<String, Error> {
        let history: Vec<Message> = self
            .db
            .recent_messages(&session.id, self.history_limit, Some(trigger.created_at))
            .await?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Sent)
            .collect();

        let system = self.prompts.system_prompt(&session.persona()).await;
        let request = CompletionRequest::new(conversation(&system.text, &history));
        debug!(
            chat_id = %session.id,
            history = history.len(),
            strict_source = %system.source,
            model = %self.llm.model_name(),
            "Requesting reply"
        );

        let text = tokio::time::timeout(self.reply_timeout, self.llm.complete(&request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                after: self.reply_timeout,
            })??;
        Ok(text)
    }
}
