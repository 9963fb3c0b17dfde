use std::sync::Arc;

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pulss_intake::config::IntakeConfig;
use pulss_intake::intake::prompts::INTAKE_SYSTEM_PROMPT;
use pulss_intake::intake::{FinalizationDispatcher, IntakeOrchestrator, intake_routes};
use pulss_intake::llm::{GenerationAdapter, create_provider};
use pulss_intake::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IntakeConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing: stderr plus a daily-rolling file
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "pulss-intake.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("📝 Pulss Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.generation.model);
    eprintln!("   API: http://0.0.0.0:{}/api/intake", config.port);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Webhook: {}",
        config.webhook_url.as_deref().unwrap_or("(disabled)")
    );
    eprintln!(
        "   Generation: {}\n",
        if config.generation.api_key.is_some() {
            "enabled"
        } else {
            "disabled (fallback text only)"
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Generation ───────────────────────────────────────────────────────
    let llm = create_provider(&config.generation).context("Failed to create LLM provider")?;
    let generation =
        GenerationAdapter::new(llm, INTAKE_SYSTEM_PROMPT, config.generation.timeout);

    // ── Dispatch ─────────────────────────────────────────────────────────
    let dispatcher = Arc::new(
        FinalizationDispatcher::from_webhook(
            config.webhook_url.as_deref(),
            config.webhook_timeout,
        )
        .context("Failed to create webhook client")?,
    );

    let orchestrator = Arc::new(IntakeOrchestrator::new(
        db,
        generation,
        Arc::clone(&dispatcher),
        &config.completion_keyword,
        config.link_ttl,
    ));

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = intake_routes(orchestrator, &config.front_base_url).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Intake server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Finalized sessions may still have a webhook delivery in flight.
    dispatcher.drain(config.webhook_timeout).await;

    tracing::info!("Intake server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
