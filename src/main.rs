// Multi-API - local relay for OpenAI-compatible APIs
//
// The relay sits between local tooling and a set of saved upstream API
// configurations. Exactly one configuration is active at a time; traffic
// sent to /proxy/* is rewritten for it (endpoint, credential, model) and
// forwarded, with streaming responses relayed chunk by chunk.
//
// Architecture:
// - Proxy server (axum): forwards /proxy/* traffic to the active upstream
// - Management API: CRUD over saved configurations, debug and language toggles
// - Store: single JSON document (db.json) holding configurations and flags
// - Debug log: toggleable JSON Lines capture of all proxied traffic

mod api;
mod cli;
mod config;
mod debug_log;
mod proxy;
mod store;

use anyhow::{Context, Result};
use config::Config;
use debug_log::DebugSession;
use std::sync::Arc;
use store::ConfigStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --path)
    // If a command was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Initialize tracing. Precedence: RUST_LOG env var > config file >
    // default "info". File logging optionally adds a JSON layer on top of
    // the stdout layer; the guard must stay alive so buffered logs flush.
    let default_filter = format!(
        "multiapi={},tower_http=debug,axum=debug",
        config.logging.level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard> =
        if config.logging.file_enabled {
            std::fs::create_dir_all(&config.logging.file_dir)
                .context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(
                &config.logging.file_dir,
                &config.logging.file_prefix,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        };

    // The store and debug session both assume their directories exist
    std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;
    std::fs::create_dir_all(&config.debug_log_dir)
        .context("Failed to create debug log directory")?;

    let store = Arc::new(ConfigStore::open(&config.data_dir)?);
    let debug = DebugSession::new(config.debug_log_dir.clone());

    // Debug mode survives restarts: resume capturing into a fresh session
    // file when the persisted flag is set
    if store.debug_mode() {
        match debug.open() {
            Ok(path) => tracing::info!("Debug mode restored, capturing to {:?}", path),
            Err(e) => tracing::warn!("Could not restore debug session: {:#}", e),
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let server_store = store.clone();
    let server_debug = debug.clone();
    let server_config = config.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = proxy::start_server(&server_config, server_store, server_debug, shutdown_rx).await
        {
            tracing::error!("Relay server failed: {:#}", e);
        }
    });

    tracing::info!(
        "multiapi v{} ready on http://{}",
        config::VERSION,
        config.bind_addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    // Close the capture session so the log ends with its session_end marker.
    // The persisted flag stays set, so the next start resumes capturing.
    debug.close().await;

    // Signal the server to drain; if the send fails it already stopped
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
