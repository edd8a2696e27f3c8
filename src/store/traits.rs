//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::chat::model::{Appended, Message, NewMessage, Session, SessionKind};
use crate::error::DatabaseError;
use crate::forms::FormDefinition;
use crate::onboarding::state::OnboardingProgress;
use crate::persona::PersonaSnapshot;

/// Backend-agnostic database trait covering forms, users, onboarding
/// progress, configs, chats and messages.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Forms ───────────────────────────────────────────────────────

    /// Publish a form, replacing any previous definition under `form_id`.
    async fn upsert_form(&self, form_id: &str, form: &FormDefinition)
    -> Result<(), DatabaseError>;

    async fn get_form(&self, form_id: &str) -> Result<Option<FormDefinition>, DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    /// The user's document, if one was ever written.
    async fn get_user_doc(&self, uid: &str) -> Result<Option<Value>, DatabaseError>;

    /// Deep-merge `patch` into the user's document, creating it if needed.
    /// Returns the merged document.
    async fn merge_user_doc(&self, uid: &str, patch: &Value) -> Result<Value, DatabaseError>;

    // ── Onboarding ──────────────────────────────────────────────────

    /// Store one step's answers, replacing any earlier answers to that step.
    /// Creates the progress record as `in_progress` on first use; a completed
    /// record stays completed.
    async fn save_onboarding_step(
        &self,
        uid: &str,
        form_id: &str,
        step_id: &str,
        answers: &Value,
        saved_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Mark the progress completed with fresh snapshots. `completed_at` keeps
    /// the first completion time.
    async fn complete_onboarding(
        &self,
        uid: &str,
        form_id: &str,
        persona_snapshot: &Value,
        profile_snapshot: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn get_onboarding_progress(
        &self,
        uid: &str,
        form_id: &str,
    ) -> Result<Option<OnboardingProgress>, DatabaseError>;

    // ── Configs ─────────────────────────────────────────────────────

    async fn get_config(&self, key: &str) -> Result<Option<Value>, DatabaseError>;

    async fn put_config(&self, key: &str, doc: &Value) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert `session` unless a session with the same id exists.
    /// Returns whether it was inserted.
    async fn insert_session_if_absent(&self, session: &Session) -> Result<bool, DatabaseError>;

    async fn get_session(&self, chat_id: &str) -> Result<Option<Session>, DatabaseError>;

    /// Sessions whose participant keys contain `participant_key`, most
    /// recently active first.
    async fn list_sessions_for(
        &self,
        participant_key: &str,
        kind: Option<SessionKind>,
        limit: usize,
    ) -> Result<Vec<Session>, DatabaseError>;

    /// Refresh a session's snapshots, pin it for `pin_uid` and bump
    /// `lastMessageAt`.
    async fn sync_session(
        &self,
        chat_id: &str,
        persona_snapshot: Option<&PersonaSnapshot>,
        profile_snapshot: Option<&Value>,
        pin_uid: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Set `isPinnedFor[uid] = true`.
    async fn pin_session(&self, chat_id: &str, uid: &str) -> Result<(), DatabaseError>;

    /// Move `lastMessageAt` forward to `at`. Never moves it backwards.
    async fn touch_session(&self, chat_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message. Its `createdAt` is strictly greater than every
    /// earlier message of the session. A message whose idempotency key is
    /// already taken is not written; the existing one is returned instead.
    async fn append_message(
        &self,
        chat_id: &str,
        message: &NewMessage,
    ) -> Result<Appended, DatabaseError>;

    async fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    async fn find_message_by_key(
        &self,
        chat_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    /// The `limit` most recent messages, oldest first. When `up_to` is set,
    /// only messages created at or before it are considered.
    async fn recent_messages(
        &self,
        chat_id: &str,
        limit: usize,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, DatabaseError>;

    async fn count_messages(&self, chat_id: &str) -> Result<usize, DatabaseError>;
}
