//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default completion model.
pub const DEFAULT_MODEL: &str = "llama3.2:3b-instruct-q4_K_M";

/// Default completion service base URL.
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the local libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Completion service base URL (without `/api/chat`).
    pub ollama_base_url: String,
    /// Model name sent with every completion request.
    pub model: String,
    /// Optional bearer token for the completion service proxy.
    pub ollama_api_key: Option<SecretString>,
    /// Upper bound for a non-streaming reply.
    pub reply_timeout: Duration,
    /// Upper bound for a streaming reply, including the body.
    pub stream_timeout: Duration,
    /// Number of most recent messages sent as conversation context.
    pub history_limit: usize,
    /// Whether `upsertForm` honours the `__devBypass` flag.
    pub allow_dev_bypass: bool,
    /// Token guarding the admin routes. Admin routes are disabled when unset.
    pub admin_token: Option<SecretString>,
    /// Header the upstream identity provider sets with the caller's uid.
    pub identity_header: String,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/lumi.db"),
            port: 8080,
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ollama_api_key: None,
            reply_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(90),
            history_limit: 20,
            allow_dev_bypass: false,
            admin_token: None,
            identity_header: "x-lumi-uid".to_string(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Build the configuration from `LUMI_*` / `OLLAMA_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            db_path: get("LUMI_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: parse_or(get("LUMI_PORT"), "LUMI_PORT", defaults.port)?,
            ollama_base_url: get("OLLAMA_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.ollama_base_url),
            model: get("OLLAMA_MODEL").unwrap_or(defaults.model),
            ollama_api_key: get("OLLAMA_API_KEY").map(SecretString::from),
            reply_timeout: Duration::from_secs(parse_or(
                get("LUMI_REPLY_TIMEOUT_SECS"),
                "LUMI_REPLY_TIMEOUT_SECS",
                defaults.reply_timeout.as_secs(),
            )?),
            stream_timeout: Duration::from_secs(parse_or(
                get("LUMI_STREAM_TIMEOUT_SECS"),
                "LUMI_STREAM_TIMEOUT_SECS",
                defaults.stream_timeout.as_secs(),
            )?),
            history_limit: parse_or(
                get("LUMI_HISTORY_LIMIT"),
                "LUMI_HISTORY_LIMIT",
                defaults.history_limit,
            )?,
            allow_dev_bypass: parse_flag(get("LUMI_ALLOW_DEV_BYPASS"), "LUMI_ALLOW_DEV_BYPASS")?,
            admin_token: get("LUMI_ADMIN_TOKEN").map(SecretString::from),
            identity_header: get("LUMI_IDENTITY_HEADER")
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or(defaults.identity_header),
            log_dir: get("LUMI_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_flag(raw: Option<String>, key: &str) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_env_yields_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.reply_timeout, Duration::from_secs(60));
        assert_eq!(config.stream_timeout, Duration::from_secs(90));
        assert!(!config.allow_dev_bypass);
        assert!(config.admin_token.is_none());
        assert_eq!(config.identity_header, "x-lumi-uid");
    }

    #[test]
    fn overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup(&[
            ("LUMI_PORT", "9000"),
            ("OLLAMA_BASE_URL", "https://llm.example.com/"),
            ("OLLAMA_MODEL", "llama3.1:8b"),
            ("LUMI_HISTORY_LIMIT", "5"),
            ("LUMI_ALLOW_DEV_BYPASS", "true"),
            ("LUMI_ADMIN_TOKEN", "s3cret"),
            ("LUMI_IDENTITY_HEADER", "X-User-Id"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.ollama_base_url, "https://llm.example.com");
        assert_eq!(config.model, "llama3.1:8b");
        assert_eq!(config.history_limit, 5);
        assert!(config.allow_dev_bypass);
        assert_eq!(config.admin_token.unwrap().expose_secret(), "s3cret");
        assert_eq!(config.identity_header, "x-user-id");
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("LUMI_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LUMI_PORT"));
    }

    #[test]
    fn invalid_flag_is_rejected() {
        let err =
            AppConfig::from_lookup(lookup(&[("LUMI_ALLOW_DEV_BYPASS", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
