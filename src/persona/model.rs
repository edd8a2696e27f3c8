//! Persona types owned by the user document and frozen into sessions.

use serde::{Deserialize, Serialize};

/// MBTI used when a session carries no persona snapshot.
pub const FALLBACK_MBTI: &str = "ENFP";

/// Personality profile driving the AI's conversational tone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    #[serde(default)]
    pub mbti: String,
    #[serde(default)]
    pub base_prompt: String,
    /// Replaces the global strict rules for this user when non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_prompt: Option<String>,
}

impl Persona {
    pub fn new(mbti: impl Into<String>, base_prompt: impl Into<String>) -> Self {
        Self {
            mbti: mbti.into(),
            base_prompt: base_prompt.into(),
            strict_prompt: None,
        }
    }

    pub fn with_strict_prompt(mut self, strict: impl Into<String>) -> Self {
        self.strict_prompt = Some(strict.into());
        self
    }

    /// Persona used for sessions that were created without one.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_MBTI, "")
    }

    /// The per-user strict override, ignoring blank values.
    pub fn strict_override(&self) -> Option<&str> {
        self.strict_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }
}

/// Which strict rule block a prompt was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum StrictSource {
    UserOverride,
    Global { version: u32 },
}

impl std::fmt::Display for StrictSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserOverride => write!(f, "user-override"),
            Self::Global { version } => write!(f, "global-v{version}"),
        }
    }
}

/// Frozen copy of a persona embedded in a session.
///
/// Later edits to the live persona do not reach a session until it is
/// explicitly re-synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaSnapshot {
    #[serde(flatten)]
    pub persona: Persona,
    /// Strict source in effect when the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_version_used: Option<StrictSource>,
}

impl PersonaSnapshot {
    pub fn capture(persona: &Persona, source: StrictSource) -> Self {
        Self {
            persona: persona.clone(),
            strict_version_used: Some(source),
        }
    }
}
