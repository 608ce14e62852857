// Request translation - turns an inbound proxy request into the outbound
// call for the active upstream configuration
//
// Translation is pure: it never performs I/O, which keeps the rewrite rules
// unit-testable without a server. The rules are:
// - the /proxy mount prefix is already stripped; the remaining path is
//   appended to the configuration's endpoint
// - paths ending in /models never reach the upstream; a fixed single-model
//   list is synthesized instead (client tools probe /models before use, and
//   the relay hides upstream model enumeration entirely)
// - the configuration's model override, when set, replaces the model named
//   in the request body
// - only Content-Type and Authorization are sent upstream; inbound headers
//   stop here so the upstream only ever sees the stored key, never the
//   caller's identity

use axum::http::{header, HeaderMap, Method};
use serde_json::{json, Value};

use crate::store::UpstreamConfig;

/// Model id returned by the models-listing shortcut. The string only
/// signals that the active backend decides which model actually runs.
pub const MODELS_SENTINEL: &str = "backend-managed";

/// Body to send upstream
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    /// No body (GET requests)
    None,
    /// JSON body, possibly with the model field rewritten
    Json(Value),
    /// Unparseable body forwarded untouched
    Raw(Vec<u8>),
}

/// A fully rewritten outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub body: OutboundBody,
    /// Classification of the *response* handling: relay chunks as they
    /// arrive instead of buffering the full body
    pub is_streaming: bool,
}

/// Result of translating one inbound request
#[derive(Debug, Clone)]
pub enum Translation {
    Outbound(OutboundRequest),
    /// Path ended in /models - answer locally, never forward
    ModelsShortcut,
}

/// Translate an inbound request (path already stripped of the mount prefix)
/// for the given active configuration.
pub fn translate(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    config: &UpstreamConfig,
) -> Translation {
    if path.ends_with("/models") {
        return Translation::ModelsShortcut;
    }

    let body_json: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(body).ok()
    };

    let is_streaming = wants_event_stream(headers) || body_requests_stream(body_json.as_ref());

    // GET forwards query parameters and no body; other methods send the
    // (possibly rewritten) body and ignore the query
    let url = match (method, query) {
        (&Method::GET, Some(q)) if !q.is_empty() => {
            format!("{}{}?{}", config.endpoint, path, q)
        }
        _ => format!("{}{}", config.endpoint, path),
    };

    let body = if *method == Method::GET {
        OutboundBody::None
    } else {
        match body_json {
            Some(mut json) => {
                rewrite_model(&mut json, config);
                OutboundBody::Json(json)
            }
            None if !body.is_empty() => OutboundBody::Raw(body.to_vec()),
            None => OutboundBody::None,
        }
    };

    Translation::Outbound(OutboundRequest {
        method: method.clone(),
        url,
        body,
        is_streaming,
    })
}

/// The configuration's model override always wins when both the body names
/// a model and the configuration sets one
fn rewrite_model(body: &mut Value, config: &UpstreamConfig) {
    let Some(model) = config.model.as_ref() else {
        return;
    };
    if let Some(obj) = body.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".to_string(), Value::String(model.clone()));
        }
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "text/event-stream")
        .unwrap_or(false)
}

fn body_requests_stream(body: Option<&Value>) -> bool {
    body.and_then(|b| b.get("stream"))
        .and_then(|s| s.as_bool())
        .unwrap_or(false)
}

/// The fixed response for the models-listing shortcut
pub fn models_list_response() -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": MODELS_SENTINEL,
            "object": "model",
            "created": chrono::Utc::now().timestamp_millis(),
            "owned_by": "system",
            "permission": [],
            "root": MODELS_SENTINEL,
            "parent": null,
        }]
    })
}
