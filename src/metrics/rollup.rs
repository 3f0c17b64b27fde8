//! Hourly grouping and daily summarisation, kept pure for testing.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::db::models::CountEntry;
use crate::db::{DailyUpsert, HourlyUpsert};
use crate::metrics::Metric;

/// Top-k mappings keep at most this many entries.
pub const TOP_K: usize = 10;

/// Truncate a timestamp to the containing UTC hour.
pub fn trunc_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .single()
        .unwrap_or(ts)
}

/// Sort a counter map descending by count (label ascending as tie-break for
/// deterministic output) and keep the top [`TOP_K`] entries.
pub fn top_k(counts: HashMap<String, i64>) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = counts
        .into_iter()
        .map(|(label, count)| CountEntry { label, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    entries.truncate(TOP_K);
    entries
}

/// Merge a previously stored top-k with a fresh batch: sum counts per label,
/// then re-truncate. Keeps hourly updates lossless within the retained k.
pub fn merge_top_k(existing: &[CountEntry], fresh: &[CountEntry]) -> Vec<CountEntry> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for entry in existing.iter().chain(fresh) {
        *counts.entry(entry.label.clone()).or_default() += entry.count;
    }
    top_k(counts)
}

/// One `(tunnel, hour)` group of buffered metrics, aggregated.
#[derive(Debug)]
pub struct HourlyGroup {
    pub tunnel_id: String,
    pub hour: DateTime<Utc>,
    pub total_requests: i64,
    pub success_requests: i64,
    pub error_requests: i64,
    pub mean_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_ips: i64,
    pub top_paths: Vec<CountEntry>,
    pub top_countries: Vec<CountEntry>,
    pub status_codes: Vec<CountEntry>,
    /// Indices into the flushed batch, for requeueing on a failed write.
    pub metric_indices: Vec<usize>,
}

impl HourlyGroup {
    pub fn into_upsert(self) -> HourlyUpsert {
        HourlyUpsert {
            tunnel_id: self.tunnel_id,
            hour: self.hour,
            total_requests: self.total_requests,
            success_requests: self.success_requests,
            error_requests: self.error_requests,
            avg_response_time: self.mean_response_time,
            total_bandwidth: self.total_bandwidth,
            unique_ips: self.unique_ips,
            top_paths: self.top_paths,
            top_countries: self.top_countries,
            status_codes: self.status_codes,
        }
    }
}

/// Group a batch of metrics by `(tunnel_id, UTC hour)` and aggregate each
/// group: counts, mean response time, bandwidth, distinct client IPs,
/// top-10 `METHOD path`, top-10 countries (nulls skipped), and the status
/// histogram.
pub fn group_by_hour(metrics: &[Metric]) -> Vec<HourlyGroup> {
    let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<usize>> = BTreeMap::new();
    for (idx, metric) in metrics.iter().enumerate() {
        let key = (metric.tunnel_id.clone(), trunc_to_hour(metric.timestamp));
        groups.entry(key).or_default().push(idx);
    }

    groups
        .into_iter()
        .map(|((tunnel_id, hour), indices)| {
            let mut success = 0i64;
            let mut error = 0i64;
            let mut response_time_sum = 0f64;
            let mut bandwidth = 0i64;
            let mut ips: HashSet<&str> = HashSet::new();
            let mut paths: HashMap<String, i64> = HashMap::new();
            let mut countries: HashMap<String, i64> = HashMap::new();
            let mut statuses: HashMap<String, i64> = HashMap::new();

            for &idx in &indices {
                let m = &metrics[idx];
                if m.status_code >= 400 {
                    error += 1;
                } else {
                    success += 1;
                }
                response_time_sum += f64::from(m.response_time_ms);
                bandwidth += m.request_size + m.response_size;
                ips.insert(m.client_ip.as_str());
                *paths
                    .entry(format!("{} {}", m.method, m.path))
                    .or_default() += 1;
                if let Some(country) = &m.country {
                    *countries.entry(country.clone()).or_default() += 1;
                }
                *statuses.entry(m.status_code.to_string()).or_default() += 1;
            }

            let total = indices.len() as i64;
            HourlyGroup {
                tunnel_id,
                hour,
                total_requests: total,
                success_requests: success,
                error_requests: error,
                mean_response_time: if total > 0 {
                    response_time_sum / total as f64
                } else {
                    0.0
                },
                total_bandwidth: bandwidth,
                unique_ips: ips.len() as i64,
                top_paths: top_k(paths),
                top_countries: top_k(countries),
                status_codes: top_k(statuses),
                metric_indices: indices,
            }
        })
        .collect()
}

/// One hour's totals feeding the daily rollup.
#[derive(Debug, Clone)]
pub struct HourTotals {
    pub hour: DateTime<Utc>,
    pub total_requests: i64,
    pub success_requests: i64,
    pub error_requests: i64,
    pub avg_response_time: f64,
    pub total_bandwidth: i64,
    pub unique_ips: i64,
}

/// Roll one tunnel's hourly rows for a day up into a daily aggregate.
///
/// Counters are summed, `avg_response_time` is the mean across hour rows
/// (approximate, unweighted), and `peak_hour` is the hour index with the
/// greatest `total_requests`.
pub fn summarize_day(tunnel_id: &str, date: NaiveDate, hours: &[HourTotals]) -> DailyUpsert {
    let mut total = 0i64;
    let mut success = 0i64;
    let mut error = 0i64;
    let mut avg_sum = 0f64;
    let mut bandwidth = 0i64;
    let mut unique_ips = 0i64;
    let mut peak_hour = 0i32;
    let mut peak_requests = i64::MIN;

    for h in hours {
        total += h.total_requests;
        success += h.success_requests;
        error += h.error_requests;
        avg_sum += h.avg_response_time;
        bandwidth += h.total_bandwidth;
        unique_ips += h.unique_ips;
        if h.total_requests > peak_requests {
            peak_requests = h.total_requests;
            peak_hour = h.hour.hour() as i32;
        }
    }

    DailyUpsert {
        tunnel_id: tunnel_id.to_string(),
        date,
        total_requests: total,
        success_requests: success,
        error_requests: error,
        avg_response_time: if hours.is_empty() {
            0.0
        } else {
            avg_sum / hours.len() as f64
        },
        total_bandwidth: bandwidth,
        unique_ips,
        peak_hour,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(
        tunnel: &str,
        ts: DateTime<Utc>,
        status: u16,
        rt_ms: u32,
        path: &str,
        ip: &str,
        country: Option<&str>,
    ) -> Metric {
        Metric {
            tunnel_id: tunnel.to_string(),
            timestamp: ts,
            method: "GET".to_string(),
            path: path.to_string(),
            status_code: status,
            response_time_ms: rt_ms,
            request_size: 10,
            response_size: 100,
            client_ip: ip.to_string(),
            country: country.map(String::from),
            user_agent: None,
        }
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_trunc_to_hour() {
        assert_eq!(trunc_to_hour(ts(14, 37)), ts(14, 0));
        assert_eq!(trunc_to_hour(ts(14, 0)), ts(14, 0));
    }

    #[test]
    fn test_rollup_counts_and_topk() {
        // Three metrics in one hour: (200,100ms,"/a"), (500,200ms,"/b"), (200,100ms,"/a")
        let metrics = vec![
            metric("t1", ts(9, 1), 200, 100, "/a", "1.1.1.1", Some("US")),
            metric("t1", ts(9, 20), 500, 200, "/b", "1.1.1.1", Some("US")),
            metric("t1", ts(9, 59), 200, 100, "/a", "2.2.2.2", None),
        ];

        let groups = group_by_hour(&metrics);
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.hour, ts(9, 0));
        assert_eq!(g.total_requests, 3);
        assert_eq!(g.success_requests, 2);
        assert_eq!(g.error_requests, 1);
        assert_eq!(g.unique_ips, 2);
        assert!((g.mean_response_time - 400.0 / 3.0).abs() < 1e-9);

        assert_eq!(g.top_paths[0].label, "GET /a");
        assert_eq!(g.top_paths[0].count, 2);
        assert_eq!(g.top_paths[1].label, "GET /b");
        assert_eq!(g.top_paths[1].count, 1);

        assert_eq!(g.top_countries, vec![CountEntry { label: "US".into(), count: 2 }]);

        let statuses: Vec<(&str, i64)> = g
            .status_codes
            .iter()
            .map(|e| (e.label.as_str(), e.count))
            .collect();
        assert_eq!(statuses, vec![("200", 2), ("500", 1)]);
    }

    #[test]
    fn test_rollup_splits_hours_and_tunnels() {
        let metrics = vec![
            metric("t1", ts(9, 1), 200, 10, "/a", "1.1.1.1", None),
            metric("t1", ts(10, 1), 200, 10, "/a", "1.1.1.1", None),
            metric("t2", ts(9, 2), 200, 10, "/a", "1.1.1.1", None),
        ];
        let groups = group_by_hour(&metrics);
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_top_k_bounded_and_sorted() {
        let mut counts = HashMap::new();
        for i in 0..25 {
            counts.insert(format!("/path{i}"), i64::from(i));
        }
        let top = top_k(counts);
        assert_eq!(top.len(), TOP_K);
        for pair in top.windows(2) {
            assert!(pair[0].count >= pair[1].count);
        }
        assert_eq!(top[0].count, 24);
    }

    #[test]
    fn test_merge_top_k_sums_and_retruncates() {
        let existing = vec![
            CountEntry { label: "GET /a".into(), count: 5 },
            CountEntry { label: "GET /b".into(), count: 3 },
        ];
        let fresh = vec![
            CountEntry { label: "GET /b".into(), count: 4 },
            CountEntry { label: "GET /c".into(), count: 1 },
        ];
        let merged = merge_top_k(&existing, &fresh);
        assert_eq!(merged[0], CountEntry { label: "GET /b".into(), count: 7 });
        assert_eq!(merged[1], CountEntry { label: "GET /a".into(), count: 5 });
        assert_eq!(merged[2], CountEntry { label: "GET /c".into(), count: 1 });
    }

    fn hour_totals(
        hour: DateTime<Utc>,
        total: i64,
        ok: i64,
        err: i64,
        avg: f64,
        bw: i64,
        ips: i64,
    ) -> HourTotals {
        HourTotals {
            hour,
            total_requests: total,
            success_requests: ok,
            error_requests: err,
            avg_response_time: avg,
            total_bandwidth: bw,
            unique_ips: ips,
        }
    }

    #[test]
    fn test_summarize_day_peak_hour() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let hours = vec![
            hour_totals(ts(3, 0), 10, 9, 1, 50.0, 1000, 2),
            hour_totals(ts(14, 0), 40, 35, 5, 70.0, 4000, 6),
            hour_totals(ts(23, 0), 5, 5, 0, 30.0, 500, 1),
        ];
        let day = summarize_day("t1", date, &hours);
        assert_eq!(day.total_requests, 55);
        assert_eq!(day.success_requests, 49);
        assert_eq!(day.error_requests, 6);
        assert_eq!(day.peak_hour, 14);
        assert!((0..=23).contains(&day.peak_hour));
        assert!((day.avg_response_time - 50.0).abs() < 1e-9);
        assert_eq!(day.total_bandwidth, 5500);
    }

    #[test]
    fn test_summarize_day_empty() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let day = summarize_day("t1", date, &[]);
        assert_eq!(day.total_requests, 0);
        assert_eq!(day.peak_hour, 0);
    }
}
