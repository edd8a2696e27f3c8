//! HTTP and WebSocket surface.

pub mod error;
pub mod identity;
pub mod routes;
pub mod ws;

pub use error::{ApiResult, CallableError};
pub use identity::{Caller, HeaderIdentity, IdentityProvider};
pub use routes::build_router;

use std::sync::Arc;

use axum::http::HeaderName;
use secrecy::SecretString;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::{
    ChatService, DirectStreamer, MessageTrigger, ReplyOrchestrator, SessionResolver,
    spawn_reply_worker,
};
use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::llm::CompletionService;
use crate::onboarding::OnboardingManager;
use crate::persona::StrictConfigCache;
use crate::store::Database;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub identity: Arc<dyn IdentityProvider>,
    pub prompts: Arc<StrictConfigCache>,
    pub onboarding: Arc<OnboardingManager>,
    pub resolver: Arc<SessionResolver>,
    pub chats: Arc<ChatService>,
    pub streamer: Arc<DirectStreamer>,
    pub allow_dev_bypass: bool,
    pub admin_token: Option<SecretString>,
}

/// A wired service: handler state plus the running reply worker.
///
/// Cancel `shutdown` and await `reply_worker` to let in-flight replies land.
pub struct Service {
    pub state: AppState,
    pub reply_worker: JoinHandle<()>,
    pub shutdown: CancellationToken,
}

/// Wire the components together and start the reply worker.
pub fn assemble(
    config: &AppConfig,
    db: Arc<dyn Database>,
    llm: Arc<dyn CompletionService>,
) -> Result<Service, ConfigError> {
    let header = HeaderName::try_from(config.identity_header.as_str()).map_err(|e| {
        ConfigError::InvalidValue {
            key: "LUMI_IDENTITY_HEADER".to_string(),
            message: e.to_string(),
        }
    })?;

    let prompts = Arc::new(StrictConfigCache::new(Arc::clone(&db)));
    let resolver = Arc::new(SessionResolver::new(Arc::clone(&db), Arc::clone(&prompts)));
    let onboarding = Arc::new(OnboardingManager::new(Arc::clone(&db), Arc::clone(&resolver)));

    let orchestrator = Arc::new(
        ReplyOrchestrator::new(Arc::clone(&db), Arc::clone(&llm), Arc::clone(&prompts))
            .with_history_limit(config.history_limit)
            .with_reply_timeout(config.reply_timeout),
    );
    let (trigger, events) = MessageTrigger::channel();
    let shutdown = CancellationToken::new();
    let reply_worker = spawn_reply_worker(orchestrator, events, shutdown.clone());

    let chats = Arc::new(ChatService::new(Arc::clone(&db), trigger));
    let streamer = Arc::new(
        DirectStreamer::new(Arc::clone(&db), llm, Arc::clone(&prompts))
            .with_history_limit(config.history_limit),
    );

    let state = AppState {
        db,
        identity: Arc::new(HeaderIdentity::new(header)),
        prompts,
        onboarding,
        resolver,
        chats,
        streamer,
        allow_dev_bypass: config.allow_dev_bypass,
        admin_token: config.admin_token.clone(),
    };

    Ok(Service {
        state,
        reply_worker,
        shutdown,
    })
}
