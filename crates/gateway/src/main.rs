use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use weft_domain::config::{Config, ConfigSeverity};
use weft_gateway::cli::{Cli, Command, ConfigCommand};
use weft_gateway::connection::ConnectionManager;
use weft_gateway::state::AppState;
use weft_gateway::api;
use weft_pipeline::{Orchestrator, TurnDeps};
use weft_providers::ProviderRegistry;
use weft_sandbox::ScriptEngine;
use weft_session::SessionRegistry;
use weft_store::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = weft_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = weft_gateway::cli::load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = weft_gateway::cli::load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("weft {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the `serve` command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weft_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("weft starting");

    // ── Config validation ────────────────────────────────────────────
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

    // ── State store & module catalog ─────────────────────────────────
    let store = Arc::new(
        FileStore::open(&config.state.path).context("opening state store")?,
    );

    // ── Providers ────────────────────────────────────────────────────
    let providers = Arc::new(
        ProviderRegistry::new(Duration::from_secs(config.providers.request_timeout_secs))
            .context("initializing provider registry")?,
    );

    // ── Sessions & sandbox ───────────────────────────────────────────
    let sessions = Arc::new(SessionRegistry::new(config.sessions.max_concurrent));
    let engine = Arc::new(ScriptEngine::new(
        Duration::from_secs(config.sandbox.script_timeout_secs),
        config.sandbox.max_operations,
    ));

    // ── Pipeline orchestrator ────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(TurnDeps {
        catalog: store.clone(),
        store: store.clone(),
        providers: Arc::clone(&providers),
        sessions: Arc::clone(&sessions),
        engine,
    }));

    let state = AppState {
        config: Arc::clone(&config),
        connections: Arc::new(ConnectionManager::new()),
        sessions: Arc::clone(&sessions),
        providers,
        orchestrator,
    };

    // Periodic sweep of tokens that finished without being removed
    // (e.g. a turn task that died mid-flight).
    let sweeper_sessions = Arc::clone(&sessions);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            sweeper_sessions.cleanup_finished();
        }
    });

    // ── HTTP server ──────────────────────────────────────────────────
    let cors = build_cors(&config.server.allowed_origins);
    let app = api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await
        .context("server error")?;
    Ok(())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Wait for ctrl-c, then cancel every in-flight chat session so turns
/// stop at their next checkpoint.
async fn shutdown_signal(sessions: Arc<SessionRegistry>) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler");
        return;
    }
    let cancelled = sessions.cancel_all();
    tracing::info!(cancelled, "shutdown: cancelled active sessions");
}
