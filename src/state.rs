//! Shared application state passed to every handler via Axum's `State`
//! extractor. Nothing lives as ambient module state; everything an ingress
//! task or background worker touches hangs off this value.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::db::Store;
use crate::metrics::MetricsHandle;
use crate::ratelimit::DeviceAuthLimits;
use crate::registry::Registry;
use crate::token::TokenService;

/// Shared application state for the tunnel server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Typed persistence gateway.
    pub store: Store,
    /// Live agent sessions keyed by tunnel id.
    pub registry: Registry,
    /// Session-token issue/verify.
    pub tokens: Arc<TokenService>,
    /// Ingress handle into the telemetry pipeline.
    pub metrics: MetricsHandle,
    /// Per-IP limiters for the device-auth endpoints.
    pub limits: Arc<DeviceAuthLimits>,
}
