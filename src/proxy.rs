//! Public HTTP front-end: `ANY /{identifier}/{rest...}`.
//!
//! Resolves the tunnel (subdomain first, then id), checks for a live agent
//! session, frames the request through the multiplexer, and maps the outcome
//! onto the status codes the public surface promises: 400 empty identifier,
//! 404 unknown tunnel, 413 oversize body, 502 not connected / lost
//! mid-flight, 503 inactive or shutting down, 504 agent deadline.

use std::collections::HashMap;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::AppError;
use crate::metrics::RequestCapture;
use crate::mux::{self, ForwardError};
use crate::protocol::ResponseFrame;
use crate::ratelimit::client_ip;
use crate::state::AppState;

/// `ANY /` — there is no identifier to route on.
pub async fn missing_identifier() -> Response {
    AppError::Validation("Missing tunnel identifier in path".to_string()).into_response()
}

/// `ANY /{identifier}` — forward to the tunnel root.
pub async fn forward_root(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    request: Request<Body>,
) -> Response {
    handle(state, identifier, String::new(), request).await
}

/// `ANY /{identifier}/{*rest}` — forward a sub-path.
pub async fn forward_path(
    State(state): State<AppState>,
    Path((identifier, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    handle(state, identifier, rest, request).await
}

async fn handle(state: AppState, identifier: String, rest: String, request: Request<Body>) -> Response {
    if identifier.is_empty() {
        return missing_identifier().await;
    }

    let method = request.method().as_str().to_string();
    let query = request.uri().query().map(ToString::to_string);
    let headers = request.headers().clone();
    let ip = client_ip(&headers);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    // Buffer the whole entity up front; anything over the cap is refused
    // before a single frame goes to the agent.
    let body = match axum::body::to_bytes(request.into_body(), state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "Request body too large"})),
            )
                .into_response();
        }
    };

    let tunnel = match state.store.get_tunnel_by_identifier(&identifier).await {
        Ok(Some(tunnel)) => tunnel,
        Ok(None) => {
            return AppError::NotFound(format!("No tunnel found for '{identifier}'"))
                .into_response();
        }
        Err(e) => return e.into_response(),
    };

    if !tunnel.is_active {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "Tunnel is not connected",
                "tunnel": {
                    "id": tunnel.id,
                    "lastConnected": tunnel.last_connected,
                    "lastDisconnected": tunnel.last_disconnected,
                },
            })),
        )
            .into_response();
    }

    let Some((session_tx, pending)) = state.registry.handles(&tunnel.id).await else {
        // Row says active but no session exists: repair best-effort, 502.
        if let Err(e) = state.store.reconcile_inactive(&tunnel.id).await {
            warn!(tunnel_id = %tunnel.id, error = %e, "Active-flag reconcile failed");
        }
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "Tunnel agent is not connected"})),
        )
            .into_response();
    };

    let path = target_path(&rest, query.as_deref());
    let capture = RequestCapture::begin(
        &tunnel.id,
        &method,
        &path,
        ip,
        body.len() as i64,
        user_agent,
    );

    let result = mux::forward(
        &session_tx,
        &pending,
        method,
        path,
        header_map_to_json(&headers),
        String::from_utf8_lossy(&body).into_owned(),
    )
    .await;

    match result {
        Ok(frame) => {
            let (response, response_size) = agent_response(frame);
            state
                .metrics
                .record(capture.finish(response.status().as_u16(), response_size));
            response
        }
        Err(e) => {
            let (status, message) = match e {
                ForwardError::SendFailed => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to reach agent")
                }
                ForwardError::DeadlineExceeded => {
                    (StatusCode::GATEWAY_TIMEOUT, "Agent did not respond in time")
                }
                ForwardError::Disconnected => {
                    (StatusCode::BAD_GATEWAY, "Agent disconnected mid-request")
                }
                ForwardError::ShuttingDown => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down")
                }
            };
            state.metrics.record(capture.finish(status.as_u16(), 0));
            (status, Json(json!({"error": message}))).into_response()
        }
    }
}

/// Target path on the agent side: `/` + rest, keeping the query string.
fn target_path(rest: &str, query: Option<&str>) -> String {
    let mut path = format!("/{rest}");
    if let Some(q) = query {
        path.push('?');
        path.push_str(q);
    }
    path
}

fn header_map_to_json(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Headers the agent controls but the server must recompute.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Turn a `response` frame into an HTTP response. Returns the response and
/// its body size for telemetry.
///
/// String bodies pass through as-is; structured bodies are re-serialised and
/// default the content-type to `application/json`.
fn agent_response(frame: ResponseFrame) -> (Response, i64) {
    let status = frame
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let (bytes, structured) = match frame.body {
        None => (Bytes::new(), false),
        Some(Value::String(s)) => (Bytes::from(s.into_bytes()), false),
        Some(value) => (
            Bytes::from(serde_json::to_vec(&value).unwrap_or_default()),
            true,
        ),
    };
    let size = bytes.len() as i64;

    let mut builder = Response::builder().status(status);
    let mut saw_content_type = false;
    if let Some(headers) = &frame.headers {
        for (name, value) in headers {
            if SKIPPED_RESPONSE_HEADERS.contains(&name.to_lowercase().as_str()) {
                continue;
            }
            if name.eq_ignore_ascii_case("content-type") {
                saw_content_type = true;
            }
            if let Ok(value) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), value);
            }
        }
    }
    if structured && !saw_content_type {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    let response = builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    (response, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(status: Option<u16>, headers: Option<HashMap<String, String>>, body: Option<Value>) -> ResponseFrame {
        ResponseFrame {
            id: "r1".to_string(),
            status_code: status,
            headers,
            body,
        }
    }

    #[test]
    fn test_target_path() {
        assert_eq!(target_path("", None), "/");
        assert_eq!(target_path("ping", None), "/ping");
        assert_eq!(target_path("a/b/c", Some("x=1")), "/a/b/c?x=1");
    }

    #[test]
    fn test_agent_response_string_body_passthrough() {
        let (response, size) = agent_response(frame(Some(200), None, Some(json!("pong"))));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(size, 4);
        // No content-type is invented for plain string bodies.
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_agent_response_structured_body_defaults_json() {
        let (response, size) = agent_response(frame(None, None, Some(json!({"ok": true}))));
        assert_eq!(response.status(), StatusCode::OK);
        assert!(size > 0);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_agent_response_headers_verbatim_but_framing_skipped() {
        let mut headers = HashMap::new();
        headers.insert("x-custom".to_string(), "yes".to_string());
        headers.insert("Content-Length".to_string(), "999".to_string());
        let (response, _) = agent_response(frame(Some(201), Some(headers), None));
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-custom").unwrap(), "yes");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_agent_response_bad_status_defaults_200() {
        let (response, _) = agent_response(frame(Some(99), None, None));
        assert_eq!(response.status(), StatusCode::OK);
    }
}
