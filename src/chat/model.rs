//! Chat sessions and their messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::persona::{Persona, PersonaSnapshot};

/// Participant key of the AI side of a user-AI session.
pub const AI_PARTICIPANT_KEY: &str = "ai";

/// Sender id used for assistant messages.
pub const AI_SENDER_ID: &str = "ai";

/// First message of every freshly created user-AI session.
pub const WELCOME_MESSAGE: &str =
    "Welcome to Lumi Dating! 👋 I'm your AI match. Say hi and tell me what you're looking for.";

/// Idempotency key of the welcome message.
pub const WELCOME_KEY: &str = "welcome";

/// Stable join key for a user participant.
pub fn user_key(uid: &str) -> String {
    format!("user:{uid}")
}

/// Idempotency key of the assistant reply to `message_id`.
pub fn reply_key(message_id: &str) -> String {
    format!("reply:{message_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    UserAi,
    UserUser,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserAi => "user-ai",
            Self::UserUser => "user-user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user-ai" => Some(Self::UserAi),
            "user-user" => Some(Self::UserUser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Participant {
    User {
        uid: String,
    },
    Ai {
        #[serde(rename = "ownerUid")]
        owner_uid: String,
    },
}

/// A conversation between a user and the AI, or between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub participant_keys: Vec<String>,
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_snapshot: Option<PersonaSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_snapshot: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub is_pinned_for: BTreeMap<String, bool>,
}

impl Session {
    /// Deterministic id of `uid`'s user-AI session.
    pub fn user_ai_id(uid: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("user-ai:{uid}").as_bytes()).to_string()
    }

    /// Deterministic id of the user-user session between `a` and `b`,
    /// independent of argument order.
    pub fn user_user_id(a: &str, b: &str) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let name = format!("user-user:{}:{first}:{second}", first.len());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// A new user-AI session, pinned for its owner.
    pub fn user_ai(
        uid: &str,
        persona: Option<PersonaSnapshot>,
        profile: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::user_ai_id(uid),
            kind: SessionKind::UserAi,
            participant_keys: vec![user_key(uid), AI_PARTICIPANT_KEY.to_string()],
            participants: vec![
                Participant::User {
                    uid: uid.to_string(),
                },
                Participant::Ai {
                    owner_uid: uid.to_string(),
                },
            ],
            persona_snapshot: persona,
            profile_snapshot: profile,
            created_at: now,
            last_message_at: now,
            is_pinned_for: BTreeMap::from([(uid.to_string(), true)]),
        }
    }

    pub fn user_user(me: &str, other: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::user_user_id(me, other),
            kind: SessionKind::UserUser,
            participant_keys: vec![user_key(me), user_key(other)],
            participants: vec![
                Participant::User {
                    uid: me.to_string(),
                },
                Participant::User {
                    uid: other.to_string(),
                },
            ],
            persona_snapshot: None,
            profile_snapshot: None,
            created_at: now,
            last_message_at: now,
            is_pinned_for: BTreeMap::new(),
        }
    }

    pub fn has_participant(&self, uid: &str) -> bool {
        let key = user_key(uid);
        self.participant_keys.iter().any(|k| *k == key)
    }

    pub fn is_pinned_for(&self, uid: &str) -> bool {
        self.is_pinned_for.get(uid).copied().unwrap_or(false)
    }

    /// Persona the AI speaks with in this session.
    pub fn persona(&self) -> Persona {
        self.persona_snapshot
            .as_ref()
            .map(|s| s.persona.clone())
            .unwrap_or_else(Persona::fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A stored chat message. Never mutated after write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

/// A message about to be appended to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub sender_id: String,
    pub text: String,
    pub status: MessageStatus,
    /// At most one message per session carries a given key.
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    pub fn user(uid: &str, text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            sender_id: uid.to_string(),
            text: text.into(),
            status: MessageStatus::Sent,
            idempotency_key: None,
        }
    }

    pub fn assistant(text: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            role: Role::Assistant,
            sender_id: AI_SENDER_ID.to_string(),
            text: text.into(),
            status,
            idempotency_key: None,
        }
    }

    pub fn welcome() -> Self {
        Self::assistant(WELCOME_MESSAGE, MessageStatus::Sent).with_idempotency_key(WELCOME_KEY)
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of appending a message.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// False when a message with the same idempotency key already existed;
    /// `message` is then the earlier one.
    pub created: bool,
}
