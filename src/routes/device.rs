//! Device activation endpoints for headless agents.
//!
//! A new agent asks for a short code, shows it to the user, and polls until
//! the (out-of-scope) browser flow binds a user and a session token to it.
//! All three endpoints are rate-limited per client IP.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::ids;
use crate::ratelimit::{client_ip, Decision, RateLimiter};
use crate::state::AppState;

/// Activation codes live this long.
const CODE_TTL_MINUTES: i64 = 10;

/// Returns the 429 response when the caller's window is exhausted.
async fn check_limit(limiter: &RateLimiter, headers: &HeaderMap) -> Option<Response> {
    match limiter.admit(&client_ip(headers)).await {
        Decision::Allowed { .. } => None,
        Decision::Limited { retry_after_secs } => Some(
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(json!({"error": "Rate limit exceeded"})),
            )
                .into_response(),
        ),
    }
}

/// `POST /api/device/code` — issue a fresh activation code (5/min per IP).
///
/// Regenerates on collision up to [`ids::DEVICE_CODE_MAX_ATTEMPTS`] times
/// before failing the request.
pub async fn create_code(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(limited) = check_limit(&state.limits.create, &headers).await {
        return limited;
    }

    let device_id = ids::device_id();
    let expires_at = Utc::now() + Duration::minutes(CODE_TTL_MINUTES);

    for _ in 0..ids::DEVICE_CODE_MAX_ATTEMPTS {
        let code = ids::device_code();
        match state
            .store
            .create_device_code(&code, &device_id, expires_at)
            .await
        {
            Ok(true) => {
                info!(device_id = %device_id, "Issued device code");
                return (
                    StatusCode::CREATED,
                    Json(json!({
                        "code": code,
                        "deviceId": device_id,
                        "expiresAt": expires_at,
                    })),
                )
                    .into_response();
            }
            Ok(false) => {} // collision, regenerate
            Err(e) => return e.into_response(),
        }
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Could not allocate a device code"})),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct VerifyBody {
    code: String,
}

/// `POST /api/device/verify` — validate a code the user typed (10/min per IP).
///
/// Marks the code claimed so the browser flow can bind a user to it.
pub async fn verify_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<VerifyBody>,
) -> Response {
    if let Some(limited) = check_limit(&state.limits.verify, &headers).await {
        return limited;
    }

    let code = body.code.trim().to_uppercase();
    let found = match state.store.find_device_code(&code).await {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };

    let Some(record) = found else {
        return AppError::NotFound("Unknown code".to_string()).into_response();
    };
    if record.is_used || record.expires_at < Utc::now() {
        return (
            StatusCode::GONE,
            Json(json!({"error": "Code expired or already used"})),
        )
            .into_response();
    }

    if let Err(e) = state.store.mark_device_code_claimed(&code).await {
        return e.into_response();
    }
    Json(json!({"valid": true, "deviceId": record.device_id})).into_response()
}

#[derive(Deserialize)]
pub struct PollQuery {
    code: String,
}

/// `GET /api/device/poll?code=…` — fetch the session token once the browser
/// flow has bound one (30/min per IP). Marks the code used on success.
pub async fn poll_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Response {
    if let Some(limited) = check_limit(&state.limits.poll, &headers).await {
        return limited;
    }

    let code = query.code.trim().to_uppercase();
    let found = match state.store.find_device_code(&code).await {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };

    let Some(record) = found else {
        return AppError::NotFound("Unknown code".to_string()).into_response();
    };
    if record.is_used || record.expires_at < Utc::now() {
        return (
            StatusCode::GONE,
            Json(json!({"error": "Code expired or already used"})),
        )
            .into_response();
    }

    match record.token {
        Some(token) => {
            if let Err(e) = state.store.mark_device_code_used(&code).await {
                return e.into_response();
            }
            info!(device_id = %record.device_id, "Device activation completed");
            Json(json!({"status": "complete", "token": token})).into_response()
        }
        None => Json(json!({"status": "pending"})).into_response(),
    }
}
