mod auth;
mod cache;
mod config;
mod content_type;
mod health;
mod http;
mod metrics;
mod storage;
mod telemetry;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::AuthGate;
use crate::cache::ArtifactCache;
use crate::config::{Config, OriginConfig, StorageBackend, StorageConfig};
use crate::metrics::MetricsRegistry;
use crate::storage::{ArtifactStore, KeyDbStore, MemoryStore};
use crate::telemetry::{AccessRecorder, ExpiryProbe};
use crate::upstream::{OriginCredentials, RemoteFetcher};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "mavencache", about = "Caching reverse proxy for Maven repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "MAVENCACHE_CONFIG", default_value = "/etc/mavencache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: ArtifactCache,
    pub auth: Arc<AuthGate>,
    pub metrics: MetricsRegistry,
    /// Producer side of the per-user access queue.
    pub access: AccessRecorder,
    pub expiry: Arc<ExpiryProbe>,
}

// ---------------------------------------------------------------------------
// Infrastructure setup
// ---------------------------------------------------------------------------

async fn build_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("using in-memory artifact store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Keydb => {
            let keydb = config
                .keydb
                .as_ref()
                .context("storage.keydb is required when storage.backend is keydb")?;
            Ok(Arc::new(KeyDbStore::connect(keydb).await?))
        }
    }
}

/// Origin password from the environment.  Basic auth is only used when both
/// halves are present.
fn origin_password(config: &OriginConfig) -> Option<String> {
    std::env::var(&config.password_env)
        .ok()
        .filter(|p| !p.is_empty())
}

fn origin_credentials(config: &OriginConfig, password: Option<&str>) -> Option<OriginCredentials> {
    match (&config.username, password) {
        (Some(username), Some(password)) => Some(OriginCredentials {
            username: username.clone(),
            password: password.to_string(),
        }),
        (Some(_), None) => {
            tracing::warn!(
                env = %config.password_env,
                "origin username configured but password variable is unset; requests will be anonymous"
            );
            None
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, prefix = %state.config.proxy.path_prefix, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Periodically write the encoded metrics to the log.
async fn run_metrics_logger(metrics: MetricsRegistry, expiry: Arc<ExpiryProbe>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        expiry.refresh();
        match metrics.encode() {
            Ok(text) => tracing::info!(target: "mavencache::stats", metrics = %text, "metrics snapshot"),
            Err(e) => tracing::warn!(error = %e, "failed to encode metrics snapshot"),
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting mavencache");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Store and origin ----
    let store = build_store(&config.storage).await?;
    let password = origin_password(&config.origin);
    let credentials = origin_credentials(&config.origin, password.as_deref());
    let fetcher = RemoteFetcher::new(&config.origin, credentials)?;
    tracing::info!(origin = %config.origin.base_url, "origin fetcher initialised");
    let cache = ArtifactCache::new(store, Arc::new(fetcher), metrics.metrics.clone());

    // ---- Auth ----
    let auth = AuthGate::from_config(&config.auth)?;
    tracing::info!(mode = ?config.auth.mode, "auth gate initialised");

    // ---- Telemetry ----
    let (access, recorder_handle) =
        AccessRecorder::spawn(metrics.metrics.clone(), config.metrics.access_queue_capacity);
    let expiry = Arc::new(ExpiryProbe::new(
        password,
        metrics.metrics.credential_seconds_until_expiration.clone(),
    ));
    expiry.refresh();

    let logger_handle = match config.metrics.log_interval_secs {
        Some(secs) if secs > 0 => Some(tokio::spawn(run_metrics_logger(
            metrics.clone(),
            Arc::clone(&expiry),
            Duration::from_secs(secs),
        ))),
        _ => None,
    };

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        cache,
        auth: Arc::new(auth),
        metrics,
        access,
        expiry,
    });

    // ---- Serve until shutdown ----
    let result = run_http_server(state).await;

    if let Some(handle) = logger_handle {
        handle.abort();
    }
    recorder_handle.abort();

    match &result {
        Ok(()) => tracing::info!("mavencache shut down cleanly"),
        Err(e) => tracing::error!(error = %e, "HTTP server failed"),
    }
    result
}
