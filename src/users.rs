//! Typed view over the schemaless user document.
//!
//! Layout: `persona` (see [`Persona`]), `profile` (free-form, filled by
//! onboarding `writeTo` rules) and `system.pinnedAIChatId`.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::persona::Persona;

#[derive(Debug, Clone, PartialEq)]
pub struct UserDocument {
    uid: String,
    doc: Value,
}

impl UserDocument {
    /// Wrap a stored document. A user without a document reads as empty.
    pub fn new(uid: impl Into<String>, doc: Option<Value>) -> Self {
        Self {
            uid: uid.into(),
            doc: doc.unwrap_or_else(|| json!({})),
        }
    }

    /// The user's persona, if one was set and is readable.
    pub fn persona(&self) -> Option<Persona> {
        let raw = self.doc.get("persona").filter(|v| v.is_object())?;
        match serde_json::from_value(raw.clone()) {
            Ok(persona) => Some(persona),
            Err(e) => {
                warn!(uid = %self.uid, error = %e, "Unreadable persona in user document");
                None
            }
        }
    }

    /// Raw persona object, `{}` when unset.
    pub fn persona_value(&self) -> Value {
        self.object_at("persona")
    }

    /// Raw profile object, `{}` when unset.
    pub fn profile(&self) -> Value {
        self.object_at("profile")
    }

    pub fn pinned_chat_id(&self) -> Option<&str> {
        self.doc
            .get("system")
            .and_then(|s| s.get("pinnedAIChatId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    fn object_at(&self, key: &str) -> Value {
        self.doc
            .get(key)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}))
    }
}

/// Patch that stores `persona`. An absent `strictPrompt` keeps the stored one.
pub fn persona_patch(persona: &Persona, now: DateTime<Utc>) -> Value {
    let mut value = json!({
        "mbti": persona.mbti,
        "basePrompt": persona.base_prompt,
        "updatedAt": now.to_rfc3339(),
    });
    if let Some(strict) = &persona.strict_prompt {
        value["strictPrompt"] = Value::String(strict.clone());
    }
    json!({ "persona": value })
}

/// Patch that records the user's pinned AI chat.
pub fn pinned_chat_patch(chat_id: &str) -> Value {
    json!({ "system": { "pinnedAIChatId": chat_id } })
}
