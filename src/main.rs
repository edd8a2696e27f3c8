use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lumi_backend::api::{assemble, build_router};
use lumi_backend::config::AppConfig;
use lumi_backend::llm::{CompletionService, OllamaClient};
use lumi_backend::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // The guard flushes the file writer on drop; keep it for the whole run.
    let _log_guard = init_tracing(&config);

    eprintln!("💬 Lumi backend v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} @ {}", config.model, config.ollama_base_url);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/callable/<name>", config.port);
    eprintln!("   Chat WS: ws://0.0.0.0:{}/ws/chat/<chatId>", config.port);
    if config.allow_dev_bypass {
        eprintln!("   ⚠️  Dev bypass enabled for upsertForm");
    }

    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    let llm: Arc<dyn CompletionService> = Arc::new(OllamaClient::from_config(&config));

    let service = assemble(&config, db, llm)?;
    let app = build_router(service.state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Lumi backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    service.shutdown.cancel();
    if let Err(e) = service.reply_worker.await {
        tracing::error!(error = %e, "Reply worker failed during shutdown");
    }
    Ok(())
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lumi.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
