mod cache;
mod config;
mod forge;
mod health;
mod http;
mod manifest;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::cleaner::{spawn_cleaner, Sweep};
use crate::cache::handler::CachedResponse;
use crate::cache::Cache;
use crate::config::Config;
use crate::forge::github::GitHubClient;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "vpmpkg", about = "VPM package repository for GitHub releases")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/vpmpkg/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    /// Where releases and package manifests come from.
    pub forge: Arc<dyn forge::ForgeBackend>,
    /// Whole manifest responses, keyed by request URL.
    pub responses: Arc<Cache<CachedResponse>>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting vpmpkg");

    // ---- Upstream token ----
    let token = std::env::var(&config.upstream.token_env)
        .ok()
        .filter(|t| !t.is_empty());
    if token.is_none() {
        tracing::warn!(
            env = %config.upstream.token_env,
            "GitHub API token not found; using the public API"
        );
    }

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("vpmpkg/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Caches ----
    let api_cache = Arc::new(
        cache::open_bytes_cache("api", &config.cache.api)?
            .with_metrics(Arc::clone(&metrics.metrics)),
    );
    let files_cache = Arc::new(
        cache::open_bytes_cache("files", &config.cache.files)?
            .with_metrics(Arc::clone(&metrics.metrics)),
    );
    let responses = Arc::new(
        cache::open_volatile_cache::<CachedResponse>("responses", &config.cache.responses)?
            .with_metrics(Arc::clone(&metrics.metrics)),
    );

    tracing::info!(
        api = ?api_cache.kind(),
        files = ?files_cache.kind(),
        responses = ?responses.kind(),
        "caches opened"
    );

    let cleaner = spawn_cleaner(
        vec![
            Arc::clone(&api_cache) as Arc<dyn Sweep>,
            Arc::clone(&files_cache) as Arc<dyn Sweep>,
            Arc::clone(&responses) as Arc<dyn Sweep>,
        ],
        Duration::from_secs(config.cache.clean_interval_secs),
    );

    // ---- Forge backend ----
    let github = GitHubClient::new(
        http_client.clone(),
        &config.upstream,
        token,
        api_cache,
        files_cache,
    )
    .with_metrics(Arc::clone(&metrics.metrics));
    tracing::info!(api_url = %github.api_url(), "GitHub client initialised");

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        http_client,
        forge: Arc::new(github),
        responses,
        metrics,
    });

    // ---- Serve until shutdown ----
    let served = run_http_server(state).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
    }

    cleaner.shutdown().await;
    tracing::info!("vpmpkg shut down cleanly");
    served
}
