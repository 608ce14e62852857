//! Proxy failure types and the uniform error envelope
//!
//! Every failure on the forwarding path is represented explicitly instead
//! of probing error objects for an attached response: either the upstream
//! answered with a non-2xx status (`UpstreamHttp`), or it never answered
//! (`Transport`), or no usable configuration existed in the first place.
//! `IntoResponse` turns any of them into the envelope the client sees, so
//! nothing on the request path can escape as a crash.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};

/// What went wrong while forwarding one request
#[derive(Debug)]
pub enum ProxyFailure {
    /// The store has no active configuration id
    NoActiveConfig,
    /// The active id no longer references an existing configuration
    ActiveConfigMissing,
    /// The upstream never produced a response (DNS, connect, timeout)
    Transport { message: String },
    /// The upstream answered with a non-2xx status; its body is passed
    /// through with diagnostics merged in
    UpstreamHttp { status: u16, body: Bytes },
}

/// Best-effort request context carried into the envelope. Fields that were
/// not resolved before the failure stay None and serialize as "unknown".
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: Option<String>,
    pub endpoint: Option<String>,
}

/// A failure bound to its request context, ready to become a response
#[derive(Debug)]
pub struct ErrorEnvelope {
    failure: ProxyFailure,
    context: RequestContext,
}

impl ErrorEnvelope {
    pub fn new(failure: ProxyFailure, context: RequestContext) -> Self {
        Self { failure, context }
    }

    /// The per-request diagnostic object embedded in every envelope
    fn details(&self, error: &str, status: Option<u16>, upstream_body: Option<&Value>) -> Value {
        let mut details = json!({
            "timestamp": Utc::now(),
            "endpoint": self.context.endpoint.as_deref().unwrap_or("unknown"),
            "path": self.context.path.as_deref().unwrap_or("unknown"),
            "method": self.context.method,
            "error": error,
        });
        if let Some(status) = status {
            details["status"] = json!(status);
        }
        if let Some(body) = upstream_body {
            details["upstream_body"] = body.clone();
        }
        details
    }
}

impl IntoResponse for ErrorEnvelope {
    fn into_response(self) -> Response {
        match &self.failure {
            ProxyFailure::NoActiveConfig => {
                let message = "No active API configuration";
                tracing::warn!("Proxy request rejected: {}", message);
                let body = json!({
                    "error": message,
                    "message": "Create a configuration and activate it before proxying",
                    "proxy_error_details": self.details(message, None, None),
                });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ProxyFailure::ActiveConfigMissing => {
                let message = "Active configuration not found";
                tracing::warn!("Proxy request rejected: {}", message);
                let body = json!({
                    "error": message,
                    "message": "The active configuration id references a deleted configuration",
                    "proxy_error_details": self.details(message, None, None),
                });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ProxyFailure::Transport { message } => {
                tracing::error!("Upstream transport error: {}", message);
                let body = json!({
                    "error": "Proxy request failed",
                    "message": message,
                    "proxy_error_details": self.details(message, None, None),
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
            ProxyFailure::UpstreamHttp { status, body } => {
                let status_code =
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                let message = format!("Upstream returned status {}", status);
                tracing::warn!("{}", message);

                match serde_json::from_slice::<Value>(body) {
                    Ok(Value::Object(mut upstream)) => {
                        // Pass the upstream error through unchanged so callers
                        // can still branch on its fields, with diagnostics
                        // merged alongside
                        let details = self.details(
                            &message,
                            Some(*status),
                            Some(&Value::Object(upstream.clone())),
                        );
                        upstream.insert("proxy_error_details".to_string(), details);
                        (status_code, Json(Value::Object(upstream))).into_response()
                    }
                    _ => {
                        // Body is not a JSON object - fall back to a minimal
                        // envelope carrying the raw text
                        let text = Value::String(String::from_utf8_lossy(body).into_owned());
                        let fallback = json!({
                            "error": "Proxy request failed",
                            "message": message,
                            "proxy_error_details": self.details(
                                &message,
                                Some(*status),
                                Some(&text),
                            ),
                        });
                        (status_code, Json(fallback)).into_response()
                    }
                }
            }
        }
    }
}
