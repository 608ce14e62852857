//! Shared state for request handlers

use std::sync::Arc;

use crate::debug_log::DebugSession;
use crate::store::ConfigStore;

/// Shared state for the relay server
///
/// Cloned per request by axum; everything inside is an Arc or an
/// internally shared handle.
#[derive(Clone)]
pub struct AppState {
    /// HTTP client for forwarding requests
    pub client: reqwest::Client,
    /// Saved upstream configurations and the active selection
    pub store: Arc<ConfigStore>,
    /// Debug capture session, consumed by the relay on every request
    pub debug: DebugSession,
}
