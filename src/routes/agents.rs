//! Live-session introspection.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AppError;
use crate::state::AppState;

/// `GET /api/agents` — list live agent sessions.
///
/// Guarded by the same session tokens agents register with, passed as
/// `Authorization: Bearer <token>`.
pub async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let authorized = token.is_some_and(|t| state.tokens.verify(t).is_some());
    if !authorized {
        return AppError::Authentication("Missing or invalid Authorization header".to_string())
            .into_response();
    }

    let agents = state.registry.summaries().await;
    Json(json!({"agents": agents})).into_response()
}
