//! Row types for the persisted schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, owned forwarding endpoint.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tunnel {
    pub id: String,
    /// Globally-unique URL path prefix.
    pub subdomain: String,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Advisory only; the server never opens it.
    pub local_port: Option<i32>,
    pub protocol: String,
    pub custom_domain: Option<String>,
    pub is_active: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub total_requests: i64,
    pub total_bandwidth: i64,
    pub created_at: DateTime<Utc>,
}

/// Short-lived out-of-band activation code for headless agents.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthCode {
    pub code: String,
    pub device_id: String,
    pub user_id: Option<Uuid>,
    pub token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub claimed: bool,
    pub created_at: DateTime<Utc>,
}

/// One `(label, count)` entry of an ordered top-k mapping. Stored as JSONB
/// arrays so descending order survives the database round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub label: String,
    pub count: i64,
}

/// Hourly aggregate, unique on `(tunnel_id, hour)`; `hour` is UTC-truncated.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HourlyStatsRow {
    pub tunnel_id: String,
    pub hour: DateTime<Utc>,
    pub total_requests: i64,
    pub success_requests: i64,
    pub error_requests: i64,
    pub avg_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_ips: i64,
    pub top_paths: sqlx::types::Json<Vec<CountEntry>>,
    pub top_countries: sqlx::types::Json<Vec<CountEntry>>,
    pub status_codes: sqlx::types::Json<Vec<CountEntry>>,
}

/// One completed public request.
#[derive(Debug, Clone)]
pub struct RequestLogRow {
    pub tunnel_id: String,
    pub path: String,
    pub method: String,
    pub status_code: i32,
    /// Milliseconds.
    pub response_time: i32,
    pub request_size: i64,
    pub response_size: i64,
    pub client_ip: String,
    pub country: Option<String>,
    /// Truncated to 500 bytes before insert.
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}
