//! Per-IP rate limiting for the device-auth endpoints.
//!
//! Each key gets a fixed window that starts on its first request and resets
//! one period after it started. Expired windows are replaced on access; a
//! periodic sweep drops idle keys so the map stays bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::RwLock;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

/// One key's current window.
struct Window {
    started: Instant,
    used: u32,
}

/// Admits up to `limit` requests per key per period.
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    limit: u32,
    period: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, period_secs: u64) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            limit,
            period: Duration::from_secs(period_secs),
        }
    }

    /// Admit or refuse one request under `key`.
    pub async fn admit(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        let window = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if now.duration_since(w.started) >= self.period {
                    w.started = now;
                    w.used = 0;
                }
            })
            .or_insert(Window {
                started: now,
                used: 0,
            });

        if window.used < self.limit {
            window.used += 1;
            Decision::Allowed {
                remaining: self.limit - window.used,
            }
        } else {
            let elapsed = now.duration_since(window.started);
            Decision::Limited {
                retry_after_secs: self.period.saturating_sub(elapsed).as_secs().max(1),
            }
        }
    }

    /// Drop windows past their period. Called periodically by the scheduler.
    pub async fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        windows.retain(|_, w| now.duration_since(w.started) < self.period);
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.windows.read().await.len()
    }
}

/// The three device-auth limiters of the public surface.
pub struct DeviceAuthLimits {
    /// Device-code creation: 5/min per IP.
    pub create: RateLimiter,
    /// Code verification: 10/min per IP.
    pub verify: RateLimiter,
    /// Token polling: 30/min per IP.
    pub poll: RateLimiter,
}

impl DeviceAuthLimits {
    pub fn new() -> Self {
        Self {
            create: RateLimiter::new(5, 60),
            verify: RateLimiter::new(10, 60),
            poll: RateLimiter::new(30, 60),
        }
    }

    pub async fn cleanup_expired(&self) {
        self.create.cleanup_expired().await;
        self.verify.cleanup_expired().await;
        self.poll.cleanup_expired().await;
    }
}

impl Default for DeviceAuthLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the client IP from proxy headers, falling back to `"unknown"`.
///
/// Checks `X-Forwarded-For` (first hop) then `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_limit_with_decreasing_remaining() {
        let limiter = RateLimiter::new(3, 60);
        assert_eq!(limiter.admit("k").await, Decision::Allowed { remaining: 2 });
        assert_eq!(limiter.admit("k").await, Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.admit("k").await, Decision::Allowed { remaining: 0 });

        match limiter.admit("k").await {
            Decision::Limited { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            Decision::Allowed { .. } => panic!("fourth request must be refused"),
        }
    }

    #[tokio::test]
    async fn test_window_resets_after_period() {
        // Zero-length period: every access finds the window expired.
        let limiter = RateLimiter::new(1, 0);
        assert!(matches!(limiter.admit("k").await, Decision::Allowed { .. }));
        assert!(matches!(limiter.admit("k").await, Decision::Allowed { .. }));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, 60);
        assert!(matches!(limiter.admit("a").await, Decision::Allowed { .. }));
        assert!(matches!(limiter.admit("a").await, Decision::Limited { .. }));
        assert!(matches!(limiter.admit("b").await, Decision::Allowed { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_windows() {
        let limiter = RateLimiter::new(5, 0);
        limiter.admit("a").await;
        limiter.admit("b").await;
        assert_eq!(limiter.tracked_keys().await, 2);
        limiter.cleanup_expired().await;
        assert_eq!(limiter.tracked_keys().await, 0);
    }

    #[test]
    fn test_client_ip_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers), "9.9.9.9");

        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        assert_eq!(client_ip(&headers), "1.2.3.4");
    }
}
