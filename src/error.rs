//! Error types for the Lumi backend.

use std::time::Duration;

/// Any failure of a library operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Form error: {0}")]
    Form(#[from] FormError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage failures. Messages carry the failing operation.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot open database: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Stored document is malformed: {0}")]
    Serialization(String),
}

/// Completion service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    HttpStatus {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} reported an error: {message}")]
    Upstream { provider: String, message: String },
}

/// Form definition and answer errors.
#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("Form {0} not found")]
    NotFound(String),

    #[error("Step {step_id} not found in form {form_id}")]
    UnknownStep { form_id: String, step_id: String },

    #[error("Invalid form definition: {0}")]
    InvalidDefinition(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step {step} points to unknown next step {next}")]
    DanglingNext { step: String, next: String },

    #[error("Form never terminates: step {0} is revisited")]
    Loop(String),

    #[error("Invalid field path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Answer required for step {0}")]
    MissingAnswer(String),

    #[error("Invalid answer for step {step}: {reason}")]
    InvalidAnswer { step: String, reason: String },
}

/// Chat session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Persona not set for user {0}")]
    PersonaNotSet(String),

    #[error("Chat {0} not found")]
    ChatNotFound(String),

    #[error("User {uid} is not a participant of chat {chat_id}")]
    NotParticipant { uid: String, chat_id: String },

    #[error("Cannot start a chat with yourself")]
    SelfChat,

    #[error("Message text is empty")]
    EmptyMessage,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
