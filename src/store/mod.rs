//! Persistence layer: libSQL-backed storage for forms, users, onboarding
//! progress, chats and messages.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
