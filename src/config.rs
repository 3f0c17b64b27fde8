//! Configuration loaded from environment variables.
//!
//! Resolution order is environment only — there is no config file. `.env` is
//! honoured via `dotenvy` at startup for local development.
//!
//! | Variable         | Default                 | Notes                           |
//! |------------------|-------------------------|---------------------------------|
//! | `PORT`           | `8080`                  | Public HTTP + agent WS port     |
//! | `BASE_URL`       | `http://localhost:8080` | Public base for tunnel URLs     |
//! | `JWT_SECRET`     | —                       | Mandatory, trimmed              |
//! | `DATABASE_URL`   | —                       | Postgres connection string      |
//! | `MAX_BODY_BYTES` | `10485760` (10 MiB)     | Request entity cap (413 above)  |
//! | `RUST_LOG`       | `tunnld=info`           | Tracing filter                  |

use std::env;

use crate::error::{AppError, Result};

/// Read an environment variable and parse it, falling back to a default on
/// missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-request deadline from HTTP ingress to agent response.
pub const REQUEST_DEADLINE_SECS: u64 = 10;

/// Seconds before a silent agent session is evicted by the heartbeat sweep.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the public HTTP listener binds (agent WS shares it).
    pub port: u16,

    /// Public base URL used to build `registered.url` for agents.
    pub base_url: String,

    /// HMAC secret for session tokens. Trimmed; startup fails when unset or
    /// empty.
    pub jwt_secret: String,

    /// Postgres connection string.
    pub database_url: String,

    /// Maximum buffered request entity size; larger bodies get 413.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env::var("JWT_SECRET")
            .map(|s| s.trim().to_string())
            .map_err(|_| AppError::Config("JWT_SECRET is not set".to_string()))?;
        if jwt_secret.is_empty() {
            return Err(AppError::Config("JWT_SECRET is empty".to_string()));
        }

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL is not set".to_string()))?;

        Ok(Self {
            port: env_parse("PORT", 8080u16),
            base_url: env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            jwt_secret,
            database_url,
            max_body_bytes: env_parse("MAX_BODY_BYTES", 10 * 1024 * 1024),
        })
    }
}
