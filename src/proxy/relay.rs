// Relay - the forwarding entry point
//
// One task per inbound request. The handler resolves the active
// configuration, translates the request, dispatches it upstream, and
// relays the response back:
//
//   DISPATCHED -> (STREAMING | BUFFERED) -> COMPLETE
//                \-> FAILED (error envelope)
//
// Buffered responses are passed through verbatim once complete. Streaming
// responses are relayed chunk by chunk as they arrive; each chunk is also
// appended to the debug capture session when one is open, in the same
// order it reached us. The handler never returns an error: every failure
// before the first response byte becomes an ErrorEnvelope, and failures
// after headers have been flushed can only end the stream.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;

use crate::debug_log::{CapturedRequest, CapturedResponse, DebugRecord, DebugSession};

use super::error::{ErrorEnvelope, ProxyFailure, RequestContext};
use super::state::AppState;
use super::translate::{self, OutboundBody, OutboundRequest, Translation};

/// Mount prefix under which the forwarding route is served
pub const MOUNT_PREFIX: &str = "/proxy";

/// Forwarding handler for `ANY /proxy/*path`
pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let path = uri
        .path()
        .strip_prefix(MOUNT_PREFIX)
        .unwrap_or(uri.path())
        .to_string();
    let query = uri.query().map(str::to_string);

    let mut context = RequestContext {
        method: method.to_string(),
        path: Some(path.clone()),
        endpoint: None,
    };

    tracing::debug!("Proxying {} {}", method, uri.path());

    let body_bytes = match to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ErrorEnvelope::new(
                ProxyFailure::Transport {
                    message: format!("Failed to read request body: {}", e),
                },
                context,
            )
            .into_response()
        }
    };

    // Resolve the active configuration; both failure modes are distinct,
    // client-fixable errors
    let Some(active_id) = state.store.active_id() else {
        return ErrorEnvelope::new(ProxyFailure::NoActiveConfig, context).into_response();
    };
    let Some(config) = state.store.find(&active_id) else {
        return ErrorEnvelope::new(ProxyFailure::ActiveConfigMissing, context).into_response();
    };
    context.endpoint = Some(config.endpoint.clone());

    let outbound = match translate::translate(
        &method,
        &path,
        query.as_deref(),
        &headers,
        &body_bytes,
        &config,
    ) {
        Translation::ModelsShortcut => {
            tracing::debug!("Models listing answered locally, no upstream call");
            return Json(translate::models_list_response()).into_response();
        }
        Translation::Outbound(outbound) => outbound,
    };

    let captured = capture_request(&method, &headers, &query, &outbound);

    // Dispatch upstream
    let forward_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            return ErrorEnvelope::new(
                ProxyFailure::Transport {
                    message: format!("Invalid HTTP method: {}", e),
                },
                context,
            )
            .into_response()
        }
    };

    let mut forward = state
        .client
        .request(forward_method, &outbound.url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", config.api_key),
        );
    forward = match &outbound.body {
        OutboundBody::None => forward,
        OutboundBody::Json(json) => forward.json(json),
        OutboundBody::Raw(bytes) => forward.body(bytes.clone()),
    };

    let response = match forward.send().await {
        Ok(response) => response,
        Err(e) => {
            return ErrorEnvelope::new(
                ProxyFailure::Transport {
                    message: e.to_string(),
                },
                context,
            )
            .into_response()
        }
    };

    let status = response.status();
    if !status.is_success() {
        // Pass the upstream error through with diagnostics merged in
        let body = response.bytes().await.unwrap_or_default();
        return ErrorEnvelope::new(
            ProxyFailure::UpstreamHttp {
                status: status.as_u16(),
                body,
            },
            context,
        )
        .into_response();
    }

    if outbound.is_streaming {
        relay_streaming(response, captured, state.debug.clone())
    } else {
        relay_buffered(response, captured, &state.debug, context).await
    }
}

/// Buffered path: await the full body and pass it through verbatim
async fn relay_buffered(
    response: reqwest::Response,
    captured: CapturedRequest,
    debug: &DebugSession,
    context: RequestContext,
) -> Response {
    let status = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ErrorEnvelope::new(
                ProxyFailure::Transport {
                    message: format!("Failed to read upstream response: {}", e),
                },
                context,
            )
            .into_response()
        }
    };

    if debug.is_active() {
        let data = serde_json::from_slice::<Value>(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
        debug.append(DebugRecord::RequestResponse {
            timestamp: Utc::now(),
            request: captured,
            response: CapturedResponse { status, data },
        });
    }

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Streaming path: relay chunks as they arrive, tapping each one into the
/// debug session. Dropping the body (client disconnect) drops the upstream
/// stream with it, which cancels the outbound call.
fn relay_streaming(
    response: reqwest::Response,
    captured: CapturedRequest,
    debug: DebugSession,
) -> Response {
    let status = response.status().as_u16();

    let stream = response.bytes_stream().scan((), move |_, chunk| {
        futures::future::ready(match chunk {
            Ok(bytes) => {
                // The capture append is a queue push to the session's writer
                // task, so the chunk reaches the client body without waiting
                // on disk; the queue preserves arrival order
                if debug.is_active() {
                    debug.append(DebugRecord::StreamChunk {
                        timestamp: Utc::now(),
                        request: captured.clone(),
                        chunk: String::from_utf8_lossy(&bytes).into_owned(),
                    });
                }
                Some(Ok::<Bytes, std::convert::Infallible>(bytes))
            }
            Err(e) => {
                // Headers are already flushed, so no envelope is possible;
                // ending the stream is the only remaining option
                tracing::error!("Streaming relay error: {}", e);
                None
            }
        })
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Snapshot of the inbound request for debug log records
fn capture_request(
    method: &Method,
    headers: &axum::http::HeaderMap,
    query: &Option<String>,
    outbound: &OutboundRequest,
) -> CapturedRequest {
    let body = match &outbound.body {
        OutboundBody::Json(json) => Some(json.clone()),
        OutboundBody::Raw(bytes) => Some(Value::String(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        OutboundBody::None => None,
    };
    CapturedRequest {
        method: method.to_string(),
        url: outbound.url.clone(),
        headers: headers
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
        query: if *method == Method::GET {
            query.clone()
        } else {
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_log::DebugRecord;
    use crate::proxy::router;
    use crate::store::ConfigStore;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    // ── Mock upstream ───────────────────────────────────────────────────

    async fn chat(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({
            "object": "chat.completion",
            "received_model": body["model"],
        }))
    }

    async fn sse_chunks() -> Response {
        // Gaps between chunks keep them from coalescing into one TCP read
        let chunks = futures::stream::unfold(0usize, |i| async move {
            if i >= 3 {
                return None;
            }
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let chunk = ["a", "b", "c"][i];
            Some((Ok::<_, Infallible>(Bytes::from(chunk)), i + 1))
        });
        Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap()
    }

    async fn missing() -> (StatusCode, Json<Value>) {
        (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
    }

    async fn sse_then_error() -> Response {
        // One good chunk, then the body stream fails mid-flight
        let chunks = futures::stream::unfold(0usize, |i| async move {
            match i {
                0 => Some((Ok::<Bytes, std::io::Error>(Bytes::from("a")), 1)),
                1 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Some((
                        Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "upstream died",
                        )),
                        2,
                    ))
                }
                _ => None,
            }
        });
        Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap()
    }

    fn upstream_router() -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/v1/stream", post(sse_chunks))
            .route("/v1/flaky", post(sse_then_error))
            .route("/v1/missing", post(missing))
            .route("/v1/usage", get(|| async { Json(json!({"ok": true})) }))
    }

    async fn spawn(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    // ── Test environment ────────────────────────────────────────────────

    struct TestEnv {
        base: String,
        store: Arc<ConfigStore>,
        debug: DebugSession,
        dir: PathBuf,
    }

    impl Drop for TestEnv {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    async fn test_env() -> TestEnv {
        let dir = std::env::temp_dir().join(format!(
            "multiapi-relay-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let log_dir = dir.join("debug_logs");
        std::fs::create_dir_all(&log_dir).unwrap();

        let store = Arc::new(ConfigStore::open(&dir).unwrap());
        let debug = DebugSession::new(log_dir);
        let state = AppState {
            client: reqwest::Client::new(),
            store: store.clone(),
            debug: debug.clone(),
        };
        let addr = spawn(router(state)).await;

        TestEnv {
            base: format!("http://{}", addr),
            store,
            debug,
            dir,
        }
    }

    async fn activate_upstream(env: &TestEnv, model: Option<&str>) -> SocketAddr {
        let upstream = spawn(upstream_router()).await;
        env.store
            .create(
                "test upstream".to_string(),
                format!("http://{}", upstream),
                "sk-test-secret".to_string(),
                model.map(String::from),
            )
            .unwrap();
        upstream
    }

    // ── Tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rejects_when_no_configuration_is_active() {
        let env = test_env().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/chat/completions", env.base))
            .json(&json!({"model": "gpt-4"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "No active API configuration");
        assert_eq!(body["proxy_error_details"]["endpoint"], "unknown");
    }

    #[tokio::test]
    async fn buffered_relay_applies_model_override_and_hides_key() {
        let env = test_env().await;
        activate_upstream(&env, Some("deepseek-chat")).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/chat/completions", env.base))
            .json(&json!({"model": "gpt-4", "messages": []}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let text = resp.text().await.unwrap();
        // The stored key is used only in the outbound Authorization header
        assert!(!text.contains("sk-test-secret"));

        let body: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["received_model"], "deepseek-chat");
    }

    #[tokio::test]
    async fn buffered_relay_records_request_response_when_capturing() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let log_path = env.debug.open().unwrap();

        let client = reqwest::Client::new();
        client
            .post(format!("{}/proxy/v1/chat/completions", env.base))
            .json(&json!({"model": "gpt-4"}))
            .send()
            .await
            .unwrap();

        env.debug.close().await;

        let records: Vec<DebugRecord> = std::fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let exchange = records
            .iter()
            .find_map(|r| match r {
                DebugRecord::RequestResponse { request, response, .. } => {
                    Some((request.clone(), response.clone()))
                }
                _ => None,
            })
            .expect("expected a request_response record");

        assert_eq!(exchange.0.method, "POST");
        assert_eq!(exchange.1.status, 200);
        assert_eq!(exchange.1.data["received_model"], "gpt-4");
    }

    #[tokio::test]
    async fn models_listing_never_reaches_upstream() {
        let env = test_env().await;
        // The mock upstream has no /v1/models route; a forwarded call
        // would surface as a 404 envelope
        activate_upstream(&env, Some("deepseek-chat")).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/proxy/v1/models", env.base))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], translate::MODELS_SENTINEL);
        assert_eq!(body["data"][0]["owned_by"], "system");
    }

    #[tokio::test]
    async fn upstream_error_passes_through_with_details() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/missing", env.base))
            .json(&json!({"model": "gpt-4"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "not found");
        let details = &body["proxy_error_details"];
        assert_eq!(details["path"], "/v1/missing");
        assert_eq!(details["method"], "POST");
        assert_eq!(details["status"], 404);
    }

    #[tokio::test]
    async fn transport_failure_is_enveloped_not_crashed() {
        let env = test_env().await;
        // Point at a port nothing listens on
        env.store
            .create(
                "dead".to_string(),
                "http://127.0.0.1:9".to_string(),
                "sk-test".to_string(),
                None,
            )
            .unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/chat/completions", env.base))
            .json(&json!({"model": "gpt-4"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Proxy request failed");
        assert_eq!(
            body["proxy_error_details"]["endpoint"],
            "http://127.0.0.1:9"
        );
    }

    #[tokio::test]
    async fn streaming_relays_chunks_in_order_and_captures_them() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let log_path = env.debug.open().unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/stream", env.base))
            .header(header::ACCEPT, "text/event-stream")
            .json(&json!({"model": "gpt-4", "stream": true}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            resp.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );

        // Client sees all bytes in order
        let mut received = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"abc");

        env.debug.close().await;

        // The capture log holds one stream_chunk per upstream chunk, in
        // arrival order
        let chunks: Vec<String> = std::fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<DebugRecord>(l).unwrap())
            .filter_map(|r| match r {
                DebugRecord::StreamChunk { chunk, .. } => Some(chunk),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn mid_stream_upstream_error_ends_the_body_after_the_prefix() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/flaky", env.base))
            .json(&json!({"stream": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // The relayed prefix arrives, then the body ends cleanly; the
        // upstream failure never surfaces as a client-side stream error
        let mut received = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.expect("stream should end cleanly after the relayed prefix");
            received.extend_from_slice(&bytes);
        }
        assert_eq!(received, b"a");
    }

    #[tokio::test]
    async fn streaming_without_capture_leaves_no_records() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/proxy/v1/stream", env.base))
            .json(&json!({"stream": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.bytes().await.unwrap();
        assert_eq!(&body[..], b"abc");

        assert!(env.debug.log_path().is_none());
    }

    #[tokio::test]
    async fn deleting_active_config_turns_requests_into_config_errors() {
        let env = test_env().await;
        activate_upstream(&env, None).await;

        let active = env.store.active_id().unwrap();
        assert!(env.store.delete(&active).unwrap());

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/proxy/v1/chat/completions", env.base))
            .json(&json!({"model": "gpt-4"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "No active API configuration");
    }

    #[tokio::test]
    async fn get_requests_forward_query_parameters() {
        let env = test_env().await;
        activate_upstream(&env, None).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/proxy/v1/usage?date=2024-01-01", env.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], true);
    }
}
