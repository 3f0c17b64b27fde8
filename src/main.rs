//! tunnld server entry point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{any, get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tunnld::geo::PrivateRanges;
use tunnld::ratelimit::DeviceAuthLimits;
use tunnld::{
    config::Config, db, metrics, proxy, registry, routes, scheduler, state::AppState, Registry,
    Result, TokenService,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnld=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("tunnld v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Public base URL: {}", config.base_url);

    let pool = db::create_pool(&config.database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready");

    let store = db::Store::new(pool);
    let tokens = Arc::new(TokenService::new(&config.jwt_secret));
    let registry = Registry::new();
    let (metrics_handle, metrics_join) = metrics::spawn(store.clone(), Arc::new(PrivateRanges));

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        store: store.clone(),
        registry: registry.clone(),
        tokens,
        metrics: metrics_handle.clone(),
        limits: Arc::new(DeviceAuthLimits::new()),
    };

    let api_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/agents", get(routes::agents::list_agents))
        .route("/api/agent/connect", get(registry::connect_ws))
        .route("/api/device/code", post(routes::device::create_code))
        .route("/api/device/verify", post(routes::device::verify_code))
        .route("/api/device/poll", get(routes::device::poll_token));

    // The forwarding surface matches everything else; static /api routes win
    // on specificity.
    let app = Router::new()
        .merge(api_routes)
        .route("/", any(proxy::missing_identifier))
        .route("/{identifier}", any(proxy::forward_root))
        .route("/{identifier}/{*rest}", any(proxy::forward_path))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(("0.0.0.0", state.config.port)).await?;
    info!("Listening on 0.0.0.0:{}", state.config.port);

    let background_tasks = scheduler::spawn_all(&state);

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down...");
    for task in background_tasks {
        task.abort();
    }

    // Close agent sessions (1000), cancel their in-flight responders (503),
    // and keep the persisted flags honest.
    let drained = registry.drain_all().await;
    for tunnel_id in &drained {
        if let Err(e) = store.mark_tunnel_disconnected(tunnel_id).await {
            warn!(tunnel_id = %tunnel_id, error = %e, "Failed to mark tunnel disconnected");
        }
    }
    if !drained.is_empty() {
        info!(count = drained.len(), "Closed agent sessions");
    }

    // One final metrics flush, bounded.
    metrics_handle.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(5), metrics_join)
        .await
        .is_err()
    {
        warn!("Metrics worker did not drain in time");
    }

    info!("Goodbye");
    Ok(())
}
