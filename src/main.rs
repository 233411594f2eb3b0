//! fydf -- resumable chunked file upload server.
//!
//! Crash-only design: every startup is a recovery. Staging files left by a
//! previous process stay on disk and are picked up when a client begins
//! the same upload again; the sweeper deletes them once they have sat
//! untouched for `uploads.max_age_seconds`. SIGTERM/SIGINT only stop
//! accepting connections and wait, bounded by `server.shutdown_timeout`,
//! for in-flight requests.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fydf::config::LoggingConfig;
use fydf::identity::StaticTokens;
use fydf::storage::backend::StorageBackend;
use fydf::upload::ExpirySweeper;

/// Environment variable overriding `storage.local.root_dir`.
const STORAGE_PATH_ENV: &str = "FYDF_STORAGE_PATH";

/// Command-line arguments for the fydf server.
#[derive(Parser, Debug)]
#[command(name = "fydf", version, about = "Resumable chunked file upload server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "fydf.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = fydf::config::load_config(&cli.config)?;
    if let Ok(root) = std::env::var(STORAGE_PATH_ENV) {
        config.storage.local.root_dir = root;
    }
    init_logging(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        fydf::metrics::init_metrics();
        fydf::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "local" => {
            let root = &config.storage.local.root_dir;
            let backend = fydf::storage::local::LocalBackend::new(root)?;
            info!("Local storage backend initialized at {}", root);
            Arc::new(backend)
        }
        "memory" => {
            warn!("Memory storage backend selected; files are lost on exit");
            Arc::new(fydf::storage::memory::MemoryBackend::new())
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected 'local' or 'memory')"),
    };

    let identity = StaticTokens::new(&config.auth.tokens);
    if identity.is_empty() {
        warn!("No bearer tokens configured; every /api request except ping will be rejected");
    } else {
        info!("{} bearer token(s) configured", identity.len());
    }

    let state = Arc::new(fydf::AppState::new(
        config.clone(),
        storage,
        Arc::new(identity),
    ));

    // The first tick fires immediately, so stale sessions and orphaned
    // staging files go at startup.
    let sweeper = ExpirySweeper::new(
        Arc::clone(&state.registry),
        config.uploads.max_age(),
        config.uploads.sweep_interval(),
    )
    .spawn();

    let app = fydf::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("fydf listening on {}", bind_addr);

    let draining = Arc::new(tokio::sync::Notify::new());
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown({
            let draining = Arc::clone(&draining);
            async move {
                shutdown_signal().await;
                draining.notify_one();
            }
        })
        .into_future();

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    tokio::select! {
        result = serve => result?,
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("In-flight requests still running after {}s; exiting", grace.as_secs());
        }
    }

    sweeper.abort();
    info!("fydf shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
