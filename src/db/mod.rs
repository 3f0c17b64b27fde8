//! Persistence gateway: pool setup plus a typed façade over the schema.
//!
//! Every operation is safe to call concurrently; no multi-row transaction
//! crosses a component boundary. Counter updates use database-level atomic
//! increments so concurrent request paths never lose updates.

pub mod models;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use models::{CountEntry, DeviceAuthCode, HourlyStatsRow, RequestLogRow, Tunnel};

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Fields an agent registration writes through to the tunnel row.
#[derive(Debug, Clone)]
pub struct TunnelUpsert {
    pub id: String,
    pub subdomain: String,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub local_port: Option<i32>,
}

/// One hourly aggregate ready to persist.
#[derive(Debug, Clone)]
pub struct HourlyUpsert {
    pub tunnel_id: String,
    pub hour: DateTime<Utc>,
    pub total_requests: i64,
    pub success_requests: i64,
    pub error_requests: i64,
    pub avg_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_ips: i64,
    pub top_paths: Vec<CountEntry>,
    pub top_countries: Vec<CountEntry>,
    pub status_codes: Vec<CountEntry>,
}

/// One daily aggregate ready to persist.
#[derive(Debug, Clone)]
pub struct DailyUpsert {
    pub tunnel_id: String,
    pub date: NaiveDate,
    pub total_requests: i64,
    pub success_requests: i64,
    pub error_requests: i64,
    pub avg_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_ips: i64,
    pub peak_hour: i32,
}

/// Typed operations over the relational schema.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ─── Tunnels ─────────────────────────────────────────────────────────────

    /// Look up a tunnel by subdomain first, then by id.
    pub async fn get_tunnel_by_identifier(&self, identifier: &str) -> Result<Option<Tunnel>> {
        let tunnel = sqlx::query_as::<_, Tunnel>(
            "SELECT * FROM tunnels WHERE subdomain = $1 OR id = $1 ORDER BY (subdomain = $1) DESC LIMIT 1",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tunnel)
    }

    /// Return the id of the tunnel owning `subdomain`, if any.
    pub async fn subdomain_owner(&self, subdomain: &str) -> Result<Option<String>> {
        let id: Option<(String,)> =
            sqlx::query_as("SELECT id FROM tunnels WHERE subdomain = $1")
                .bind(subdomain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(|(id,)| id))
    }

    /// Create or refresh a tunnel row on registration. The update branch
    /// marks the tunnel connected; the create branch takes the owner from
    /// the session token.
    pub async fn upsert_tunnel(&self, up: &TunnelUpsert) -> Result<Tunnel> {
        let tunnel = sqlx::query_as::<_, Tunnel>(
            r"
            INSERT INTO tunnels
                (id, subdomain, user_id, name, description, local_port,
                 is_active, connected_at, last_connected)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, now(), now())
            ON CONFLICT (id) DO UPDATE SET
                subdomain      = EXCLUDED.subdomain,
                name           = EXCLUDED.name,
                description    = EXCLUDED.description,
                local_port     = EXCLUDED.local_port,
                is_active      = TRUE,
                connected_at   = now(),
                last_connected = now()
            RETURNING *
            ",
        )
        .bind(&up.id)
        .bind(&up.subdomain)
        .bind(up.user_id)
        .bind(&up.name)
        .bind(&up.description)
        .bind(up.local_port)
        .fetch_one(&self.pool)
        .await?;
        Ok(tunnel)
    }

    /// Transport closed or session evicted: flip the persisted flag.
    pub async fn mark_tunnel_disconnected(&self, tunnel_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tunnels SET is_active = FALSE, last_disconnected = now() WHERE id = $1",
        )
        .bind(tunnel_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Best-effort repair when the row says active but no session exists.
    pub async fn reconcile_inactive(&self, tunnel_id: &str) -> Result<()> {
        sqlx::query("UPDATE tunnels SET is_active = FALSE WHERE id = $1")
            .bind(tunnel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cumulative per-tunnel counters, bumped once per completed request.
    pub async fn bump_tunnel_totals(&self, tunnel_id: &str, bandwidth: i64) -> Result<()> {
        sqlx::query(
            r"
            UPDATE tunnels
            SET total_requests = total_requests + 1,
                total_bandwidth = total_bandwidth + $2
            WHERE id = $1
            ",
        )
        .bind(tunnel_id)
        .bind(bandwidth)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Users ───────────────────────────────────────────────────────────────

    /// Insert the user named by a session token if absent.
    pub async fn create_user_if_missing(&self, user_id: Uuid, email: &str) -> Result<()> {
        sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Live stats ──────────────────────────────────────────────────────────

    /// Eager per-request live-stats update. `avg_response_time` is last-wins
    /// and `error_rate` is an accumulator; both are the documented semantics
    /// the dashboards depend on.
    pub async fn upsert_live_stats(
        &self,
        tunnel_id: &str,
        response_time_ms: f64,
        is_error: bool,
    ) -> Result<()> {
        let error_delta = f64::from(i32::from(is_error));
        sqlx::query(
            r"
            INSERT INTO live_stats
                (tunnel_id, requests_last_5min, requests_last_1hour,
                 avg_response_time, error_rate, last_updated)
            VALUES ($1, 1, 1, $2, $3, now())
            ON CONFLICT (tunnel_id) DO UPDATE SET
                requests_last_5min  = live_stats.requests_last_5min + 1,
                requests_last_1hour = live_stats.requests_last_1hour + 1,
                avg_response_time   = EXCLUDED.avg_response_time,
                error_rate          = live_stats.error_rate + $3,
                last_updated        = now()
            ",
        )
        .bind(tunnel_id)
        .bind(response_time_ms)
        .bind(error_delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zero the rolling counters on rows not touched since `cutoff`.
    /// Returns how many rows were decayed.
    pub async fn decay_live_stats(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE live_stats
            SET requests_last_5min = 0, requests_last_1hour = 0
            WHERE last_updated < $1
              AND (requests_last_5min <> 0 OR requests_last_1hour <> 0)
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ─── Hourly / daily stats ────────────────────────────────────────────────

    /// Read one hourly row, if present.
    pub async fn get_hourly_stats(
        &self,
        tunnel_id: &str,
        hour: DateTime<Utc>,
    ) -> Result<Option<HourlyStatsRow>> {
        let row = sqlx::query_as::<_, HourlyStatsRow>(
            "SELECT tunnel_id, hour, total_requests, success_requests, error_requests,
                    avg_response_time, total_bandwidth, unique_ips,
                    top_paths, top_countries, status_codes
             FROM hourly_stats WHERE tunnel_id = $1 AND hour = $2",
        )
        .bind(tunnel_id)
        .bind(hour)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Upsert one hourly aggregate. Counters are incremented on conflict;
    /// `avg_response_time` and the (already merged) top-k arrays are
    /// overwritten with the values supplied.
    pub async fn upsert_hourly_stats(&self, up: &HourlyUpsert) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO hourly_stats
                (tunnel_id, hour, total_requests, success_requests, error_requests,
                 avg_response_time, total_bandwidth, unique_ips,
                 top_paths, top_countries, status_codes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tunnel_id, hour) DO UPDATE SET
                total_requests    = hourly_stats.total_requests + EXCLUDED.total_requests,
                success_requests  = hourly_stats.success_requests + EXCLUDED.success_requests,
                error_requests    = hourly_stats.error_requests + EXCLUDED.error_requests,
                avg_response_time = EXCLUDED.avg_response_time,
                total_bandwidth   = hourly_stats.total_bandwidth + EXCLUDED.total_bandwidth,
                unique_ips        = hourly_stats.unique_ips + EXCLUDED.unique_ips,
                top_paths         = EXCLUDED.top_paths,
                top_countries     = EXCLUDED.top_countries,
                status_codes      = EXCLUDED.status_codes
            ",
        )
        .bind(&up.tunnel_id)
        .bind(up.hour)
        .bind(up.total_requests)
        .bind(up.success_requests)
        .bind(up.error_requests)
        .bind(up.avg_response_time)
        .bind(up.total_bandwidth)
        .bind(up.unique_ips)
        .bind(Json(&up.top_paths))
        .bind(Json(&up.top_countries))
        .bind(Json(&up.status_codes))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All hourly rows with `hour` in `[start, end)`, across tunnels.
    pub async fn hourly_stats_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyStatsRow>> {
        let rows = sqlx::query_as::<_, HourlyStatsRow>(
            "SELECT tunnel_id, hour, total_requests, success_requests, error_requests,
                    avg_response_time, total_bandwidth, unique_ips,
                    top_paths, top_countries, status_codes
             FROM hourly_stats WHERE hour >= $1 AND hour < $2
             ORDER BY tunnel_id, hour",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Upsert one daily aggregate, keyed by `(tunnel_id, date)`.
    pub async fn upsert_daily_stats(&self, up: &DailyUpsert) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO daily_stats
                (tunnel_id, date, total_requests, success_requests, error_requests,
                 avg_response_time, total_bandwidth, unique_ips, peak_hour)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tunnel_id, date) DO UPDATE SET
                total_requests    = EXCLUDED.total_requests,
                success_requests  = EXCLUDED.success_requests,
                error_requests    = EXCLUDED.error_requests,
                avg_response_time = EXCLUDED.avg_response_time,
                total_bandwidth   = EXCLUDED.total_bandwidth,
                unique_ips        = EXCLUDED.unique_ips,
                peak_hour         = EXCLUDED.peak_hour
            ",
        )
        .bind(&up.tunnel_id)
        .bind(up.date)
        .bind(up.total_requests)
        .bind(up.success_requests)
        .bind(up.error_requests)
        .bind(up.avg_response_time)
        .bind(up.total_bandwidth)
        .bind(up.unique_ips)
        .bind(up.peak_hour)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Request log ─────────────────────────────────────────────────────────

    pub async fn insert_request_log(&self, row: &RequestLogRow) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO request_logs
                (tunnel_id, path, method, status_code, response_time,
                 request_size, response_size, client_ip, country, user_agent, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(&row.tunnel_id)
        .bind(&row.path)
        .bind(&row.method)
        .bind(row.status_code)
        .bind(row.response_time)
        .bind(row.request_size)
        .bind(row.response_size)
        .bind(&row.client_ip)
        .bind(&row.country)
        .bind(&row.user_agent)
        .bind(row.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Device auth codes ───────────────────────────────────────────────────

    pub async fn find_device_code(&self, code: &str) -> Result<Option<DeviceAuthCode>> {
        let row = sqlx::query_as::<_, DeviceAuthCode>(
            "SELECT * FROM device_auth_codes WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert a fresh activation code. Fails on collision — callers
    /// regenerate and retry.
    pub async fn create_device_code(
        &self,
        code: &str,
        device_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO device_auth_codes (code, device_id, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (code) DO NOTHING",
        )
        .bind(code)
        .bind(device_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_device_code_claimed(&self, code: &str) -> Result<()> {
        sqlx::query("UPDATE device_auth_codes SET claimed = TRUE WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_device_code_used(&self, code: &str) -> Result<()> {
        sqlx::query("UPDATE device_auth_codes SET is_used = TRUE WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop expired codes. Returns how many were removed.
    pub async fn delete_expired_device_codes(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_auth_codes WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
