//! Background task scheduler.
//!
//! Runs the periodic maintenance the pipeline depends on: live-stats decay,
//! device-code cleanup, rate-limit window eviction, agent heartbeat sweep,
//! and the local-midnight daily rollup.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::Result;
use crate::metrics::rollup;
use crate::state::AppState;

/// Live-stats rows untouched for this long get their rolling counters zeroed.
const DECAY_MINUTES: i64 = 10;

/// Spawn all background tasks. The handles are aborted on shutdown.
pub fn spawn_all(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    // Live-stats decay (every 10 minutes)
    {
        let store = state.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - ChronoDuration::minutes(DECAY_MINUTES);
                match store.decay_live_stats(cutoff).await {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "Decayed stale live-stats rows"),
                    Err(e) => warn!(error = %e, "Live-stats decay failed"),
                }
            }
        }));
    }

    // Expired device-code cleanup (every 10 minutes)
    {
        let store = state.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.delete_expired_device_codes().await {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "Deleted expired device codes"),
                    Err(e) => warn!(error = %e, "Device-code cleanup failed"),
                }
            }
        }));
    }

    // Rate-limiter window eviction (every minute)
    {
        let limits = state.limits.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limits.cleanup_expired().await;
            }
        }));
    }

    // Agent heartbeat sweep (every 30 seconds)
    {
        let registry = state.registry.clone();
        let store = state.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for tunnel_id in registry.sweep_stale().await {
                    if let Err(e) = store.mark_tunnel_disconnected(&tunnel_id).await {
                        warn!(tunnel_id = %tunnel_id, error = %e, "Failed to mark swept tunnel disconnected");
                    }
                }
            }
        }));
    }

    // Daily rollup: first run at the next local midnight, then every 24 h.
    {
        let store = state.store.clone();
        tasks.push(tokio::spawn(async move {
            let wait = until_next_local_midnight(Local::now());
            debug!(secs = wait.as_secs(), "Daily rollup scheduled");
            tokio::time::sleep(wait).await;
            let mut ticker = interval(Duration::from_secs(24 * 3600));
            loop {
                ticker.tick().await;
                match run_daily_rollup(&store).await {
                    Ok(tunnels) => info!(tunnels, "Daily rollup complete"),
                    Err(e) => warn!(error = %e, "Daily rollup failed"),
                }
            }
        }));
    }

    tasks
}

/// Time left until the next local-timezone midnight.
fn until_next_local_midnight(now: DateTime<Local>) -> std::time::Duration {
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .unwrap_or_else(|| now.date_naive());
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight");
    let next = Local
        .from_local_datetime(&midnight)
        .earliest()
        .unwrap_or_else(|| now + ChronoDuration::hours(24));
    (next - now).to_std().unwrap_or_default()
}

/// Roll yesterday's hourly rows up into `daily_stats`, one row per tunnel.
/// Returns the number of tunnels rolled up.
pub async fn run_daily_rollup(store: &Store) -> Result<usize> {
    let today = Local::now().date_naive();
    let Some(yesterday) = today.pred_opt() else {
        return Ok(0);
    };

    let start = local_midnight_utc(yesterday);
    let end = local_midnight_utc(today);

    let rows = store.hourly_stats_between(start, end).await?;
    let mut by_tunnel: BTreeMap<String, Vec<rollup::HourTotals>> = BTreeMap::new();
    for row in rows {
        by_tunnel
            .entry(row.tunnel_id.clone())
            .or_default()
            .push(rollup::HourTotals {
                hour: row.hour,
                total_requests: row.total_requests,
                success_requests: row.success_requests,
                error_requests: row.error_requests,
                avg_response_time: row.avg_response_time,
                total_bandwidth: row.total_bandwidth,
                unique_ips: row.unique_ips,
            });
    }

    let count = by_tunnel.len();
    for (tunnel_id, hours) in by_tunnel {
        let day = rollup::summarize_day(&tunnel_id, yesterday, &hours);
        store.upsert_daily_stats(&day).await?;
    }
    Ok(count)
}

/// Midnight of a local date, as a UTC instant.
fn local_midnight_utc(date: chrono::NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).expect("valid midnight");
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| Utc.from_utc_datetime(&midnight), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_local_midnight_bounds() {
        let wait = until_next_local_midnight(Local::now());
        // DST can stretch a local day to 25 hours.
        assert!(wait <= std::time::Duration::from_secs(25 * 3600));
    }

    #[test]
    fn test_local_midnight_utc_window_is_24h() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let next = date.succ_opt().unwrap();
        let span = local_midnight_utc(next) - local_midnight_utc(date);
        // DST shifts can make a local day 23 or 25 hours long.
        assert!(span >= ChronoDuration::hours(23));
        assert!(span <= ChronoDuration::hours(25));
    }
}
