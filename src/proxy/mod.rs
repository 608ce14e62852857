// Proxy module - the relay server
//
// Submodules:
// - state: shared handler state (HTTP client, store, debug session)
// - translate: pure request rewriting for the active configuration
// - relay: the forwarding handler, buffered and streaming paths
// - error: failure taxonomy and the uniform error envelope

pub mod error;
mod relay;
pub mod state;
pub mod translate;

pub use state::AppState;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::any;
use axum::Router;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::debug_log::DebugSession;
use crate::store::ConfigStore;

/// Build the full application router: the management API plus the
/// catch-all forwarding route. Exposed separately from `start_server` so
/// tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(crate::api::routes())
        .route("/proxy/*path", any(relay::proxy_handler))
        .with_state(state)
}

/// Outbound HTTP client shared by all forwarded requests
fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .http1_only();
    // 0 disables the deadline; streaming completions can legitimately run
    // for many minutes
    if timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_secs));
    }
    builder.build().context("Failed to build HTTP client")
}

/// Run the relay server until the shutdown signal fires
pub async fn start_server(
    config: &Config,
    store: Arc<ConfigStore>,
    debug: DebugSession,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let state = AppState {
        client: build_client(config.upstream_timeout_secs)?,
        store,
        debug,
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Relay listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
            tracing::info!("Shutdown signal received, draining connections");
        })
        .await
        .context("Server error")?;

    Ok(())
}
