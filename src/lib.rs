//! Lumi dating-chat backend: onboarding forms, persona prompts and
//! AI chat sessions.

pub mod api;
pub mod chat;
pub mod config;
pub mod document;
pub mod error;
pub mod forms;
pub mod llm;
pub mod onboarding;
pub mod persona;
pub mod store;
pub mod users;
