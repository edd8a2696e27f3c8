//! System prompt assembly: global strict rules plus the persona block.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::model::{Persona, StrictSource};
use crate::store::Database;

/// Config key of the global strict rules document.
pub const STRICT_CONFIG_KEY: &str = "llm";

/// Version reported when no global strict config is stored.
pub const DEFAULT_STRICT_VERSION: u32 = 1;

/// Built-in strict rules used until a global config is published.
pub const DEFAULT_STRICT_PROMPT: &str = "[Behavior Rules]
- Be direct and sincere. Avoid excessive politeness or frequent apologies; faithfully reflect the user's personality.
- Never reveal or ask for private information (name, phone, email, address, ID).
- You cannot and will not access the user's phone, any app, files, camera, microphone or system settings.
- Do not claim to perform actions in the real world; you can only produce text.
- Do not provide external links or downloads, and do not ask for any permissions.
[Style]
- Natural, concise and warm. When a line is crossed, set the boundary clearly and change the subject.";

/// The singleton global strict rules document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStrictConfig {
    pub strict_prompt: String,
    pub version: u32,
}

impl Default for GlobalStrictConfig {
    fn default() -> Self {
        Self {
            strict_prompt: DEFAULT_STRICT_PROMPT.to_string(),
            version: DEFAULT_STRICT_VERSION,
        }
    }
}

impl GlobalStrictConfig {
    /// Interpret a stored config document. A missing or blank `strictPrompt`
    /// falls back to the built-in rules; a missing `version` counts as 1.
    pub fn from_document(doc: &Value) -> Self {
        let Some(strict) = doc
            .get("strictPrompt")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
        else {
            return Self::default();
        };
        let version = doc
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_STRICT_VERSION);
        Self {
            strict_prompt: strict.to_string(),
            version,
        }
    }
}

/// An assembled system prompt and the strict rules it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPrompt {
    pub text: String,
    pub source: StrictSource,
}

/// Compose the strict block with the persona block.
///
/// The per-user override wins over `global`. Only the persona's `mbti` and
/// `basePrompt` reach the persona block.
pub fn build_system_prompt(persona: &Persona, global: &GlobalStrictConfig) -> SystemPrompt {
    let (strict, source) = match persona.strict_override() {
        Some(strict) => (strict, StrictSource::UserOverride),
        None => (
            global.strict_prompt.as_str(),
            StrictSource::Global {
                version: global.version,
            },
        ),
    };

    SystemPrompt {
        text: format!(
            "{strict}\n\n[Persona]\nMBTI: {}\nTraits & preferences: {}",
            persona.mbti, persona.base_prompt
        ),
        source,
    }
}

/// Process-wide read-through cache of the global strict config.
///
/// The first successful read is kept until [`StrictConfigCache::invalidate`]
/// is called, so an updated config may be served stale until then. A failed
/// read serves the built-in rules without populating the cache.
pub struct StrictConfigCache {
    db: Arc<dyn Database>,
    cached: RwLock<Option<Arc<GlobalStrictConfig>>>,
}

impl StrictConfigCache {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            cached: RwLock::new(None),
        }
    }

    /// The cached config, loading it on first use.
    pub async fn get(&self) -> Arc<GlobalStrictConfig> {
        if let Some(config) = self.cached.read().await.as_ref() {
            return Arc::clone(config);
        }

        let mut slot = self.cached.write().await;
        if let Some(config) = slot.as_ref() {
            return Arc::clone(config);
        }

        match self.db.get_config(STRICT_CONFIG_KEY).await {
            Ok(doc) => {
                let config = Arc::new(
                    doc.as_ref()
                        .map(GlobalStrictConfig::from_document)
                        .unwrap_or_default(),
                );
                info!(
                    version = config.version,
                    stored = doc.is_some(),
                    "Global strict config loaded"
                );
                *slot = Some(Arc::clone(&config));
                config
            }
            Err(e) => {
                warn!(error = %e, "Failed to load global strict config, using built-in rules");
                Arc::new(GlobalStrictConfig::default())
            }
        }
    }

    /// Drop the cached config; the next read reloads it from the store.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        info!("Global strict config cache invalidated");
    }

    /// Strict source `persona` would be built from right now.
    pub async fn source_for(&self, persona: &Persona) -> StrictSource {
        match persona.strict_override() {
            Some(_) => StrictSource::UserOverride,
            None => StrictSource::Global {
                version: self.get().await.version,
            },
        }
    }

    /// Build the system prompt for `persona`. The global config is only read
    /// when the persona has no override.
    pub async fn system_prompt(&self, persona: &Persona) -> SystemPrompt {
        let prompt = match persona.strict_override() {
            Some(_) => build_system_prompt(persona, &GlobalStrictConfig::default()),
            None => build_system_prompt(persona, &*self.get().await),
        };
        debug!(strict_source = %prompt.source, "System prompt built");
        prompt
    }
}
