//! Personas and the system prompts built from them.

pub mod model;
pub mod prompt;

pub use model::{Persona, PersonaSnapshot, StrictSource};
pub use prompt::{
    DEFAULT_STRICT_PROMPT, GlobalStrictConfig, StrictConfigCache, SystemPrompt,
    build_system_prompt,
};
