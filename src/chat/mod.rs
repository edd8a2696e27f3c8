//! Chat sessions: resolution, user writes, replies and direct streaming.

pub mod model;
pub mod reply;
pub mod resolver;
pub mod service;
pub mod stream;
pub mod trigger;

pub use model::{Message, MessageStatus, NewMessage, Role, Session, SessionKind};
pub use reply::{REPLY_ERROR_TEXT, ReplyOrchestrator, ReplyOutcome};
pub use resolver::{Resolved, SessionResolver};
pub use service::ChatService;
pub use stream::{CancelToken, DirectStreamer, STREAM_FAILURE_NOTICE, StreamOutcome, TurnResult};
pub use trigger::{MessageCreated, MessageTrigger, spawn_reply_worker};
