// Management API - CRUD over saved upstream configurations plus the
// debug-mode and language toggles
//
// Every response uses the same envelope: {"success": true, "data": ...}
// or {"success": false, "message": ...}. Listing never exposes stored API
// keys; fetching a single configuration does, so clients can populate an
// edit form.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::proxy::AppState;
use crate::store::UpstreamConfig;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/configs", get(list_configs).post(create_config))
        .route(
            "/api/configs/:id",
            get(get_config).put(update_config).delete(delete_config),
        )
        .route("/api/configs/:id/activate", post(activate_config))
        .route("/api/active-config", get(active_config))
        .route("/api/models/:id", get(upstream_models))
        .route("/api/debug-mode", get(debug_mode).post(set_debug_mode))
        .route("/api/language", get(language).post(set_language))
}

/// Incoming create/update payload; field names match the persisted
/// camelCase convention
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    model: Option<String>,
}

impl ConfigPayload {
    /// Name, endpoint and key are required; model stays optional. Empty
    /// model strings collapse to None so the override never fires on "".
    fn validate(self) -> Result<(String, String, String, Option<String>), Response> {
        if self.name.trim().is_empty()
            || self.endpoint.trim().is_empty()
            || self.api_key.trim().is_empty()
        {
            return Err(failure(
                StatusCode::BAD_REQUEST,
                "name, endpoint and apiKey are required",
            ));
        }
        let model = self.model.filter(|m| !m.trim().is_empty());
        // Trailing slashes would double up when paths are appended
        let endpoint = self.endpoint.trim_end_matches('/').to_string();
        Ok((self.name, endpoint, self.api_key, model))
    }
}

fn success(data: Value) -> Response {
    Json(json!({"success": true, "data": data})).into_response()
}

fn success_message(message: &str) -> Response {
    Json(json!({"success": true, "message": message})).into_response()
}

fn failure(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

fn storage_failure(e: anyhow::Error) -> Response {
    tracing::error!("Store persistence failed: {:#}", e);
    failure(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to persist configuration store",
    )
}

/// Listing view of one configuration; the key never appears here
fn summary(config: &UpstreamConfig, active_id: Option<&str>) -> Value {
    json!({
        "id": config.id,
        "name": config.name,
        "endpoint": config.endpoint,
        "isActive": Some(config.id.as_str()) == active_id,
    })
}

// ── Configurations ──────────────────────────────────────────────────────

async fn list_configs(State(state): State<AppState>) -> Response {
    let active = state.store.active_id();
    let configs: Vec<Value> = state
        .store
        .list()
        .iter()
        .map(|c| summary(c, active.as_deref()))
        .collect();
    success(Value::Array(configs))
}

async fn create_config(
    State(state): State<AppState>,
    Json(payload): Json<ConfigPayload>,
) -> Response {
    let (name, endpoint, api_key, model) = match payload.validate() {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    match state.store.create(name, endpoint, api_key, model) {
        Ok(config) => {
            tracing::info!("Created configuration {} ({})", config.name, config.id);
            success(json!(config))
        }
        Err(e) => storage_failure(e),
    }
}

async fn get_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.find(&id) {
        Some(config) => success(json!(config)),
        None => failure(StatusCode::NOT_FOUND, "Configuration not found"),
    }
}

async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ConfigPayload>,
) -> Response {
    let (name, endpoint, api_key, model) = match payload.validate() {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    match state.store.update(&id, name, endpoint, api_key, model) {
        Ok(Some(config)) => success(json!(config)),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Configuration not found"),
        Err(e) => storage_failure(e),
    }
}

async fn delete_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete(&id) {
        Ok(true) => {
            tracing::info!("Deleted configuration {}", id);
            success_message("Configuration deleted")
        }
        Ok(false) => failure(StatusCode::NOT_FOUND, "Configuration not found"),
        Err(e) => storage_failure(e),
    }
}

async fn activate_config(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.activate(&id) {
        Ok(true) => {
            tracing::info!("Activated configuration {}", id);
            success_message("Configuration activated")
        }
        Ok(false) => failure(StatusCode::NOT_FOUND, "Configuration not found"),
        Err(e) => storage_failure(e),
    }
}

async fn active_config(State(state): State<AppState>) -> Response {
    let config = state
        .store
        .active_id()
        .and_then(|id| state.store.find(&id));
    match config {
        Some(config) => success(json!(config)),
        None => success(Value::Null),
    }
}

/// Fetch the model list from one configuration's upstream, using its stored
/// key. Works for any saved configuration, active or not, so a client can
/// populate a model picker before switching.
async fn upstream_models(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(config) = state.store.find(&id) else {
        return failure(StatusCode::NOT_FOUND, "Configuration not found");
    };

    let response = match state
        .client
        .get(format!("{}/models", config.endpoint))
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", config.api_key))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Model listing request to {} failed: {}", config.endpoint, e);
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch model list",
            );
        }
    };

    let status = response.status();
    if !status.is_success() {
        let bytes = response.bytes().await.unwrap_or_default();
        let error = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        let status_code =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return (
            status_code,
            Json(json!({
                "success": false,
                "message": "Failed to fetch model list",
                "error": error,
            })),
        )
            .into_response();
    }

    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("Model listing from {} was not JSON: {}", config.endpoint, e);
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch model list",
            );
        }
    };

    // OpenAI-compatible shape: {"data": [{"id": ...}, ...]}
    let models: Vec<Value> = body["data"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m["id"].as_str())
                .map(|id| json!({"id": id, "name": id}))
                .collect()
        })
        .unwrap_or_default();
    success(Value::Array(models))
}

// ── Debug mode ──────────────────────────────────────────────────────────

async fn debug_mode(State(state): State<AppState>) -> Response {
    success(json!({
        "enabled": state.debug.is_active(),
        "logFile": state.debug.log_path(),
    }))
}

#[derive(Debug, Deserialize)]
struct DebugModePayload {
    enabled: bool,
}

/// Toggling opens or closes the capture session and persists the flag so a
/// restart resumes capturing into a fresh session file
async fn set_debug_mode(
    State(state): State<AppState>,
    Json(payload): Json<DebugModePayload>,
) -> Response {
    if payload.enabled {
        let log_file = match state.debug.open() {
            Ok(path) => path,
            Err(e) => {
                tracing::error!("Failed to open debug session: {:#}", e);
                return failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to open debug session log",
                );
            }
        };
        if let Err(e) = state.store.set_debug_mode(true) {
            return storage_failure(e);
        }
        success(json!({"enabled": true, "logFile": log_file}))
    } else {
        state.debug.close().await;
        if let Err(e) = state.store.set_debug_mode(false) {
            return storage_failure(e);
        }
        success(json!({"enabled": false}))
    }
}

// ── Interface language ──────────────────────────────────────────────────

async fn language(State(state): State<AppState>) -> Response {
    success(json!({"language": state.store.language()}))
}

#[derive(Debug, Deserialize)]
struct LanguagePayload {
    language: String,
}

async fn set_language(
    State(state): State<AppState>,
    Json(payload): Json<LanguagePayload>,
) -> Response {
    if payload.language != "zh" && payload.language != "en" {
        return failure(StatusCode::BAD_REQUEST, "language must be \"zh\" or \"en\"");
    }
    match state.store.set_language(payload.language.clone()) {
        Ok(()) => success(json!({"language": payload.language})),
        Err(e) => storage_failure(e),
    }
}
