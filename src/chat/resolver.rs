//! Find-or-create of the canonical user-AI session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::model::{NewMessage, Session, SessionKind, user_key};
use crate::error::{Result, SessionError};
use crate::persona::{Persona, PersonaSnapshot, StrictConfigCache};
use crate::store::Database;
use crate::users::{UserDocument, pinned_chat_patch};

/// A resolved session id and whether this call created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub chat_id: String,
    pub created: bool,
}

pub struct SessionResolver {
    db: Arc<dyn Database>,
    prompts: Arc<StrictConfigCache>,
}

impl SessionResolver {
    pub fn new(db: Arc<dyn Database>, prompts: Arc<StrictConfigCache>) -> Self {
        Self { db, prompts }
    }

    /// Complete `uid`'s onboarding for `form_id` and hand back their pinned
    /// user-AI session. Safe to repeat: later calls refresh the snapshots of
    /// the same session.
    pub async fn finalize_onboarding(&self, uid: &str, form_id: &str) -> Result<Resolved> {
        let user = self.load_user(uid).await?;
        let persona_value = user.persona_value();
        let profile = user.profile();
        let now = Utc::now();

        self.db
            .complete_onboarding(uid, form_id, &persona_value, &profile, now)
            .await?;

        let snapshot = match user.persona() {
            Some(persona) => Some(self.snapshot(&persona).await),
            None => None,
        };
        let resolved = self.ensure_user_ai(uid, snapshot, Some(profile), true).await?;
        self.db
            .merge_user_doc(uid, &pinned_chat_patch(&resolved.chat_id))
            .await?;

        info!(
            uid = %uid,
            form_id = %form_id,
            chat_id = %resolved.chat_id,
            created = resolved.created,
            "Onboarding finalized"
        );
        Ok(resolved)
    }

    /// Get or create `uid`'s user-AI session. Requires a persona. An existing
    /// session keeps its snapshots.
    pub async fn start_user_ai_chat(&self, uid: &str) -> Result<Resolved> {
        let user = self.load_user(uid).await?;
        let persona = user
            .persona()
            .ok_or_else(|| SessionError::PersonaNotSet(uid.to_string()))?;

        let snapshot = self.snapshot(&persona).await;
        let resolved = self
            .ensure_user_ai(uid, Some(snapshot), Some(user.profile()), false)
            .await?;
        if user.pinned_chat_id() != Some(resolved.chat_id.as_str()) {
            self.db
                .merge_user_doc(uid, &pinned_chat_patch(&resolved.chat_id))
                .await?;
        }
        Ok(resolved)
    }

    /// Get or create the session between `me` and `other`.
    pub async fn start_user_user_chat(&self, me: &str, other: &str) -> Result<Resolved> {
        if me == other {
            return Err(SessionError::SelfChat.into());
        }
        let session = Session::user_user(me, other, Utc::now());
        let created = self.db.insert_session_if_absent(&session).await?;
        if created {
            info!(chat_id = %session.id, "User-user chat created");
        }
        Ok(Resolved {
            chat_id: session.id,
            created,
        })
    }

    /// The session a user lands in when opening the chat tab: the pinned
    /// session when it is still theirs, else the resolved user-AI session.
    pub async fn pinned_chat(&self, uid: &str) -> Result<Resolved> {
        let user = self.load_user(uid).await?;
        if let Some(chat_id) = user.pinned_chat_id() {
            match self.db.get_session(chat_id).await? {
                Some(session) if session.has_participant(uid) => {
                    return Ok(Resolved {
                        chat_id: session.id,
                        created: false,
                    });
                }
                _ => {}
            }
        }
        debug!(uid = %uid, "No usable pinned chat, resolving");
        self.start_user_ai_chat(uid).await
    }

    async fn load_user(&self, uid: &str) -> Result<UserDocument> {
        Ok(UserDocument::new(uid, self.db.get_user_doc(uid).await?))
    }

    async fn snapshot(&self, persona: &Persona) -> PersonaSnapshot {
        PersonaSnapshot::capture(persona, self.prompts.source_for(persona).await)
    }

    /// The user's existing user-AI session: the one under the deterministic
    /// id, or one created before ids were derived from the user.
    async fn find_user_ai(&self, uid: &str) -> Result<Option<Session>> {
        if let Some(session) = self.db.get_session(&Session::user_ai_id(uid)).await? {
            return Ok(Some(session));
        }
        let mut legacy = self
            .db
            .list_sessions_for(&user_key(uid), Some(SessionKind::UserAi), 1)
            .await?;
        Ok(legacy.pop())
    }

    async fn ensure_user_ai(
        &self,
        uid: &str,
        snapshot: Option<PersonaSnapshot>,
        profile: Option<Value>,
        refresh: bool,
    ) -> Result<Resolved> {
        let now = Utc::now();
        if let Some(existing) = self.find_user_ai(uid).await? {
            if refresh {
                self.db
                    .sync_session(&existing.id, snapshot.as_ref(), profile.as_ref(), uid, now)
                    .await?;
            } else {
                self.db.pin_session(&existing.id, uid).await?;
            }
            return Ok(Resolved {
                chat_id: existing.id,
                created: false,
            });
        }

        let session = Session::user_ai(uid, snapshot, profile, now);
        let created = self.db.insert_session_if_absent(&session).await?;
        if created {
            self.db
                .append_message(&session.id, &NewMessage::welcome())
                .await?;
            info!(uid = %uid, chat_id = %session.id, "User-AI chat created");
        } else {
            self.db.pin_session(&session.id, uid).await?;
        }
        Ok(Resolved {
            chat_id: session.id,
            created,
        })
    }
}
