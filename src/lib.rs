#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::unused_async)]

//! # tunnld
//!
//! Self-hosted HTTP reverse tunnel. Agents open a long-lived WebSocket to
//! this server and register a tunnel id; public HTTP requests addressed to
//! `/{identifier}/...` are framed over that socket to the agent, which
//! forwards them to a service on its loopback and streams the response back.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, router setup, background tasks, graceful shutdown
//! config.rs        — environment configuration
//! error.rs         — AppError + IntoResponse mapping
//! state.rs         — process-scoped AppState
//! ids.rs           — device codes, device ids, correlation ids
//! token.rs         — HS256 session tokens (issue/verify)
//! geo.rs           — country resolution with private-range short-circuit
//! ratelimit.rs     — per-IP limiter for the device-auth endpoints
//! protocol.rs      — agent wire frames and close codes
//! registry.rs      — agent sessions: register, duplicate eviction, disconnect
//! mux.rs           — request/response correlation and deadlines
//! proxy.rs         — ANY /{identifier}/{rest...} public front-end
//! scheduler.rs     — periodic maintenance tasks
//! metrics/         — capture, live stats, hourly/daily rollups
//! db/              — connection pool, typed store, row models
//! routes/          — health, device activation, session introspection
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod ids;
pub mod metrics;
pub mod mux;
pub mod protocol;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod token;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use db::Store;
pub use error::{AppError, Result};
pub use registry::Registry;
pub use state::AppState;
pub use token::TokenService;
