//! Liveness and readiness probe.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// `GET /api/health` — probe for load balancers and uptime monitors.
///
/// Reports `"ok"` with 200 while the database answers, `"degraded"` with 503
/// when it does not (agent sessions keep running either way, but
/// registrations and stats writes will fail). The body also carries the
/// counters an operator checks first: connected agents, uptime, and metrics
/// dropped under backpressure.
pub async fn health(State(state): State<AppState>) -> Response {
    let database_up = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Health probe: database unreachable");
            false
        }
    };

    let status = if database_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": if database_up { "ok" } else { "degraded" },
        "database": database_up,
        "agents": state.registry.len().await,
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "droppedMetrics": state.metrics.dropped(),
        "version": env!("CARGO_PKG_VERSION"),
    }));

    (status, body).into_response()
}
