use crate::config::{HookMapping, HooksConfig};
use crate::daemon::{AgentDaemon, WakeEvent};
use anyhow::Result;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Shared state for the hooks server.
pub struct HooksState {
    daemon: Arc<AgentDaemon>,
    config: HooksConfig,
}

impl HooksState {
    pub fn new(daemon: Arc<AgentDaemon>, config: HooksConfig) -> Arc<Self> {
        Arc::new(Self { daemon, config })
    }
}

/// Build the hooks router: `POST {base}/wake`, `POST {base}/agent`, the
/// configured mappings, `GET /health`, and CORS preflight. Nothing else is
/// honored.
pub fn build_router(state: Arc<HooksState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(hooks_handler)
        .with_state(state)
}

pub async fn start(state: Arc<HooksState>) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let bind = format!("{}:{}", state.config.host, state.config.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    info!("hooks server listening on {addr}");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("hooks server error: {e}");
        }
    });
    Ok((handle, addr))
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({"status": "ok", "version": crate::VERSION}))
}

fn cors_preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Authorization, Content-Type, X-CoWork-Token",
            ),
        ],
    )
        .into_response()
}

fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    (status, axum::Json(json!({"error": {"code": code, "message": message}}))).into_response()
}

/// Extract and verify the request token. Bearer and `X-CoWork-Token` are
/// the supported carriers; query-string tokens still work but are logged
/// as deprecated.
fn authorize(config: &HooksConfig, headers: &HeaderMap, uri: &Uri) -> bool {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
        .or_else(|| {
            headers
                .get("X-CoWork-Token")
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        })
        .or_else(|| {
            let from_query = uri.query().and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("token=").map(ToString::to_string))
            });
            if from_query.is_some() {
                warn!("hooks: query-string token is deprecated, use the Authorization header");
            }
            from_query
        });

    let Some(presented) = presented else {
        return false;
    };
    if config.token.is_empty() {
        return false;
    }
    config
        .token
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}

async fn read_body(body: Body, max: usize, timeout: Duration) -> Result<Bytes, Response> {
    match tokio::time::timeout(timeout, axum::body::to_bytes(body, max)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(_)) => Err(error_body(
            StatusCode::PAYLOAD_TOO_LARGE,
            "INVALID_INPUT",
            "request body too large",
        )),
        // Slow-loris protection: a body that never finishes is cut off
        Err(_) => Err(error_body(
            StatusCode::REQUEST_TIMEOUT,
            "INVALID_INPUT",
            "request body read timed out",
        )),
    }
}

async fn hooks_handler(
    State(state): State<Arc<HooksState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method == Method::OPTIONS {
        return cors_preflight();
    }
    if method != Method::POST {
        return error_body(
            StatusCode::METHOD_NOT_ALLOWED,
            "INVALID_INPUT",
            "only POST is supported",
        );
    }

    let config = &state.config;
    if !authorize(config, &headers, &uri) {
        return error_body(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing or bad token");
    }

    let path = uri.path().to_string();
    let base = config.base_path.trim_end_matches('/');
    let Some(rest) = path.strip_prefix(base) else {
        return error_body(StatusCode::NOT_FOUND, "INVALID_INPUT", "unknown endpoint");
    };

    let bytes = match read_body(
        body,
        config.max_body_bytes,
        Duration::from_secs(config.read_timeout_secs),
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };
    let body_str = String::from_utf8_lossy(&bytes).to_string();
    let body_json: Option<Value> = serde_json::from_slice(&bytes).ok();

    match rest {
        "/wake" => handle_wake(&state, body_json.as_ref()).await,
        "/agent" => handle_agent(&state, body_json.as_ref()).await,
        _ => {
            for mapping in &config.mappings {
                if !mapping_matches(mapping, rest, &headers, body_json.as_ref()) {
                    continue;
                }
                if !mapping.signature_secret.is_empty() {
                    let signature = headers
                        .get("X-Signature-256")
                        .or_else(|| headers.get("X-Hub-Signature-256"))
                        .and_then(|v| v.to_str().ok());
                    let valid = signature.is_some_and(|sig| {
                        validate_signature(&mapping.signature_secret, sig, &bytes)
                    });
                    if !valid {
                        warn!("hooks: bad payload signature on {}", mapping.path);
                        return error_body(
                            StatusCode::FORBIDDEN,
                            "FORBIDDEN",
                            "invalid payload signature",
                        );
                    }
                }
                return run_mapping(&state, mapping, &body_str, body_json.as_ref()).await;
            }
            error_body(StatusCode::NOT_FOUND, "INVALID_INPUT", "unknown endpoint")
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Validate an HMAC-SHA256 signature against a payload. Accepts raw hex or
/// the `sha256=`-prefixed form.
pub fn validate_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    expected.as_bytes().ct_eq(sig.as_bytes()).into()
}

async fn handle_wake(state: &Arc<HooksState>, body: Option<&Value>) -> Response {
    let message = body
        .and_then(|b| b["message"].as_str())
        .unwrap_or("Wake up and check for pending work.")
        .to_string();
    let mode = body
        .and_then(|b| b["mode"].as_str())
        .unwrap_or("now");
    if mode != "now" && mode != "next-heartbeat" {
        return error_body(
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            "mode must be 'now' or 'next-heartbeat'",
        );
    }
    match state
        .daemon
        .enqueue_wake(WakeEvent {
            message,
            immediate: mode == "now",
        })
        .await
    {
        Ok(task) => {
            debug!("hooks: wake accepted (mode={mode})");
            let mut payload = json!({"status": "queued", "mode": mode});
            if let Some(task) = task {
                payload["taskId"] = json!(task.id);
            }
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, "METHOD_FAILED", &e.to_string()),
    }
}

async fn handle_agent(state: &Arc<HooksState>, body: Option<&Value>) -> Response {
    let Some(message) = body.and_then(|b| b["message"].as_str()) else {
        return error_body(StatusCode::BAD_REQUEST, "INVALID_INPUT", "missing 'message'");
    };
    match state
        .daemon
        .enqueue_wake(WakeEvent {
            message: message.to_string(),
            immediate: true,
        })
        .await
    {
        Ok(Some(task)) => (
            StatusCode::ACCEPTED,
            axum::Json(json!({"taskId": task.id})),
        )
            .into_response(),
        Ok(None) => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "METHOD_FAILED",
            "task was not created",
        ),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, "METHOD_FAILED", &e.to_string()),
    }
}

/// Declarative mapping predicate: path equality, exact header values, and
/// JSON-pointer equality. No expression evaluation.
fn mapping_matches(
    mapping: &HookMapping,
    path: &str,
    headers: &HeaderMap,
    body: Option<&Value>,
) -> bool {
    if mapping.path != path {
        return false;
    }
    for (name, expected) in &mapping.headers {
        let actual = headers.get(name).and_then(|v| v.to_str().ok());
        if actual != Some(expected.as_str()) {
            return false;
        }
    }
    for predicate in &mapping.json_equals {
        let Some(body) = body else { return false };
        if body.pointer(&predicate.pointer) != Some(&predicate.equals) {
            return false;
        }
    }
    true
}

/// Apply a template string, substituting `{{body}}` with the raw body and
/// `{{key}}` with top-level JSON payload values.
fn apply_template(template: &str, body_str: &str, json: Option<&Value>) -> String {
    let mut result = template.replace("{{body}}", body_str);
    if let Some(Value::Object(map)) = json {
        for (key, value) in map {
            let placeholder = format!("{{{{{}}}}}", key);
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &replacement);
        }
    }
    result
}

async fn run_mapping(
    state: &Arc<HooksState>,
    mapping: &HookMapping,
    body_str: &str,
    body_json: Option<&Value>,
) -> Response {
    let template = if mapping.template.is_empty() {
        "{{body}}"
    } else {
        &mapping.template
    };
    let message = apply_template(template, body_str, body_json);
    let prompt = json!({"message": message});
    match mapping.action.as_str() {
        "agent" => handle_agent(state, Some(&prompt)).await,
        _ => handle_wake(state, Some(&prompt)).await,
    }
}
