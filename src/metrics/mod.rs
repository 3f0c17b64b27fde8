//! Telemetry pipeline: per-request capture, eager live-stats updates, and
//! buffered hourly rollups.
//!
//! ## Data path
//!
//! 1. **Capture** — the ingress task builds a [`RequestCapture`] when it hands
//!    the request to the multiplexer.
//! 2. **Finalize** — after the response is written, the capture is completed
//!    into a [`Metric`] and pushed onto a bounded channel. When the channel is
//!    saturated the metric is dropped, never the response.
//! 3. **Worker** — a dedicated task resolves the country, updates live stats
//!    and the request log eagerly, and buffers the metric. The buffer flushes
//!    into `hourly_stats` at 100 entries or every 2 minutes, whichever comes
//!    first; both triggers run through the same worker so flushes never
//!    overlap.
//!
//! A panic inside a flush is confined to its spawned task: the batch is
//! discarded, the panic logged, and the ticker stays armed.

pub mod rollup;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::db::models::RequestLogRow;
use crate::db::Store;
use crate::geo::CountryResolver;

/// Buffered metrics that trigger an immediate flush.
pub const FLUSH_THRESHOLD: usize = 100;

/// Periodic flush interval.
pub const FLUSH_INTERVAL_SECS: u64 = 120;

/// Bounded channel between ingress tasks and the worker.
const CHANNEL_CAPACITY: usize = 1024;

/// `user_agent` is truncated to this many bytes before persisting.
const USER_AGENT_MAX_BYTES: usize = 500;

/// One completed public request, ready for aggregation.
#[derive(Debug, Clone)]
pub struct Metric {
    pub tunnel_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: u32,
    pub request_size: i64,
    pub response_size: i64,
    pub client_ip: String,
    pub country: Option<String>,
    pub user_agent: Option<String>,
}

/// Snapshot taken at request ingress; completed into a [`Metric`] once the
/// response has been written. Owned by the ingress task, so no keyed
/// in-flight map is needed.
#[derive(Debug)]
pub struct RequestCapture {
    tunnel_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
    method: String,
    path: String,
    client_ip: String,
    request_size: i64,
    user_agent: Option<String>,
}

impl RequestCapture {
    pub fn begin(
        tunnel_id: &str,
        method: &str,
        path: &str,
        client_ip: String,
        request_size: i64,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            method: method.to_string(),
            path: path.to_string(),
            client_ip,
            request_size,
            user_agent,
        }
    }

    /// Finish the capture with the response outcome.
    pub fn finish(self, status_code: u16, response_size: i64) -> Metric {
        let elapsed_ms = u32::try_from(self.started.elapsed().as_millis()).unwrap_or(u32::MAX);
        Metric {
            tunnel_id: self.tunnel_id,
            timestamp: self.started_at,
            method: self.method,
            path: self.path,
            status_code,
            response_time_ms: elapsed_ms,
            request_size: self.request_size,
            response_size,
            client_ip: self.client_ip,
            country: None,
            user_agent: self.user_agent,
        }
    }
}

enum Event {
    Metric(Box<Metric>),
    Shutdown,
}

/// Cheap handle the ingress path uses to feed the worker.
#[derive(Clone)]
pub struct MetricsHandle {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl MetricsHandle {
    /// Queue a finalized metric. Drops (with a counter bump) when the worker
    /// is saturated — the ingress path never waits here.
    pub fn record(&self, metric: Metric) {
        if self.tx.try_send(Event::Metric(Box::new(metric))).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "Metrics channel saturated, dropping metric");
        }
    }

    /// Number of metrics dropped due to backpressure since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the worker to flush once and exit. Await the worker's join handle
    /// (with a deadline) after calling this.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }
}

/// Spawn the pipeline worker. Returns the ingress handle and the worker's
/// join handle for shutdown sequencing.
pub fn spawn(
    store: Store,
    geo: Arc<dyn CountryResolver>,
) -> (MetricsHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = MetricsHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let worker = Worker {
        store,
        geo,
        buffer: Vec::with_capacity(FLUSH_THRESHOLD),
        rx,
    };
    let join = tokio::spawn(worker.run());
    (handle, join)
}

struct Worker {
    store: Store,
    geo: Arc<dyn CountryResolver>,
    buffer: Vec<Metric>,
    rx: mpsc::Receiver<Event>,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(Event::Metric(metric)) => self.ingest(*metric).await,
                    Some(Event::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        // Final best-effort flush before the task exits.
        self.flush().await;
    }

    /// Finalization: resolve country, update live stats and the request log
    /// eagerly, then buffer for the hourly rollup.
    async fn ingest(&mut self, mut metric: Metric) {
        metric.country = self.geo.resolve(&metric.client_ip);

        let is_error = metric.status_code >= 400;
        if let Err(e) = self
            .store
            .upsert_live_stats(&metric.tunnel_id, f64::from(metric.response_time_ms), is_error)
            .await
        {
            warn!(tunnel_id = %metric.tunnel_id, error = %e, "Live-stats update failed");
        }
        if let Err(e) = self
            .store
            .bump_tunnel_totals(&metric.tunnel_id, metric.request_size + metric.response_size)
            .await
        {
            warn!(tunnel_id = %metric.tunnel_id, error = %e, "Tunnel totals update failed");
        }

        let log_row = RequestLogRow {
            tunnel_id: metric.tunnel_id.clone(),
            path: metric.path.clone(),
            method: metric.method.clone(),
            status_code: i32::from(metric.status_code),
            response_time: i32::try_from(metric.response_time_ms).unwrap_or(i32::MAX),
            request_size: metric.request_size,
            response_size: metric.response_size,
            client_ip: metric.client_ip.clone(),
            country: metric.country.clone(),
            user_agent: metric.user_agent.as_deref().map(|ua| truncate_bytes(ua, USER_AGENT_MAX_BYTES)),
            timestamp: metric.timestamp,
        };
        if let Err(e) = self.store.insert_request_log(&log_row).await {
            warn!(tunnel_id = %metric.tunnel_id, error = %e, "Request log insert failed");
        }

        self.buffer.push(metric);
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    /// Drain the buffer and roll it up into `hourly_stats`. Runs in a child
    /// task so a panic cannot take the worker down; groups that fail to
    /// persist are requeued for the next flush.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let count = batch.len();
        let store = self.store.clone();

        match tokio::spawn(flush_batch(store, batch)).await {
            Ok(requeued) => {
                if requeued.is_empty() {
                    debug!(count, "Flushed metrics buffer");
                } else {
                    warn!(
                        count,
                        requeued = requeued.len(),
                        "Partial metrics flush, requeueing failed groups"
                    );
                    self.buffer.extend(requeued);
                }
            }
            Err(e) if e.is_panic() => {
                error!(count, "Metrics flush panicked, batch discarded");
            }
            Err(_) => {}
        }
    }
}

/// Persist one drained batch. Returns the metrics belonging to groups whose
/// write failed, for requeueing.
async fn flush_batch(store: Store, batch: Vec<Metric>) -> Vec<Metric> {
    let groups = rollup::group_by_hour(&batch);
    let mut failed: Vec<usize> = Vec::new();

    for group in groups {
        let indices = group.metric_indices.clone();
        let mut up = group.into_upsert();

        // Merge the stored top-k with this batch's before upserting, so an
        // hour spanning several flushes keeps its counts.
        match store.get_hourly_stats(&up.tunnel_id, up.hour).await {
            Ok(Some(existing)) => {
                up.top_paths = rollup::merge_top_k(&existing.top_paths.0, &up.top_paths);
                up.top_countries = rollup::merge_top_k(&existing.top_countries.0, &up.top_countries);
                up.status_codes = rollup::merge_top_k(&existing.status_codes.0, &up.status_codes);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(tunnel_id = %up.tunnel_id, error = %e, "Hourly read failed");
                failed.extend(indices);
                continue;
            }
        }

        if let Err(e) = store.upsert_hourly_stats(&up).await {
            warn!(tunnel_id = %up.tunnel_id, hour = %up.hour, error = %e, "Hourly upsert failed");
            failed.extend(indices);
        }
    }

    failed.sort_unstable();
    failed.into_iter().map(|i| batch[i].clone()).collect()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_bytes_ascii() {
        assert_eq!(truncate_bytes("hello", 500), "hello");
        assert_eq!(truncate_bytes(&"x".repeat(600), 500).len(), 500);
    }

    #[test]
    fn test_truncate_bytes_respects_char_boundary() {
        // 'é' is two bytes; a cut at byte 2 would split it
        assert_eq!(truncate_bytes("aéé", 2), "a");
        assert_eq!(truncate_bytes("aéé", 3), "aé");
        assert_eq!(truncate_bytes("aéé", 4), "aé");
        assert_eq!(truncate_bytes("aéé", 5), "aéé");
    }

    #[test]
    fn test_capture_finish_carries_fields() {
        let capture = RequestCapture::begin(
            "t1",
            "GET",
            "/ping",
            "1.2.3.4".to_string(),
            42,
            Some("curl/8.0".to_string()),
        );
        let metric = capture.finish(200, 4);
        assert_eq!(metric.tunnel_id, "t1");
        assert_eq!(metric.method, "GET");
        assert_eq!(metric.path, "/ping");
        assert_eq!(metric.status_code, 200);
        assert_eq!(metric.request_size, 42);
        assert_eq!(metric.response_size, 4);
        assert!(metric.country.is_none());
    }
}
