use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use pa_domain::config::{Config, ConfigSeverity};
use pa_gateway::cli::{self, Cli, Command};
use pa_gateway::runtime::scheduler_loop;
use pa_gateway::state::AppState;
use pa_gateway::api;
use pa_providers::ProviderRegistry;
use pa_storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = cli::load_config()?;
            tracing::info!(config_path = %config_path, "configuration loaded");
            run_server(Arc::new(config)).await
        }
        Some(Command::Chat { channel }) => {
            let (config, _) = cli::load_config()?;
            cli::chat::chat(&config, channel).await
        }
        Some(Command::Status) => {
            let (config, _) = cli::load_config()?;
            cli::status(&config).await
        }
        Some(Command::Init { force }) => cli::init::init(force),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pa_gateway=debug")),
        )
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("personal-agent starting");

    // ── Config validation (missing `default` agent is fatal) ─────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Storage (migrations apply here; unreadable DB is fatal) ──────
    let storage = Storage::open(Path::new(&config.server.db_path))
        .with_context(|| format!("opening database {}", config.server.db_path))?;
    tracing::info!(db_path = %config.server.db_path, "storage ready");

    // ── LLM providers ────────────────────────────────────────────────
    let providers = Arc::new(ProviderRegistry::from_config(&config));
    if providers.is_empty() {
        tracing::warn!(
            "no LLM providers initialized — the gateway will run but turns will fail \
             until a provider credential is configured"
        );
    } else {
        tracing::info!(providers = providers.len(), "provider registry ready");
    }

    // ── Runtime state ────────────────────────────────────────────────
    let state = AppState::new(config.clone(), storage, providers);
    tracing::info!("entity runtime + scheduler core ready");

    // ── Scheduler tick loop ──────────────────────────────────────────
    scheduler_loop::spawn(state.clone());
    tracing::info!(
        tick_secs = scheduler_loop::TICK_INTERVAL.as_secs(),
        "scheduler tick loop started"
    );

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "personal-agent listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
