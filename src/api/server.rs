// dpau: HTTP server assembly

use crate::api::handlers;
use crate::error::{EngineError, EngineResult};
use crate::limiter::SlidingWindowLimiter;
use crate::metrics::HttpMetrics;
use crate::pipeline::Pipeline;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Process-wide service state shared by every handler.
pub struct AppState {
    pub pipeline: Pipeline,
    pub metrics: HttpMetrics,
    pub limiter: SlidingWindowLimiter,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> EngineResult<Self> {
        let limiter = SlidingWindowLimiter::per_minute(pipeline.config().rate_limit_per_minute);
        Ok(Self {
            pipeline,
            metrics: HttpMetrics::new()?,
            limiter,
        })
    }
}

/// Assemble the router: authenticated JSON API plus open probe endpoints,
/// with request metrics around everything.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/event", post(handlers::ingest_events))
        .route("/dau/:day", get(handlers::get_dau))
        .route("/mau", get(handlers::get_mau))
        .route("/budget/:metric", get(handlers::get_budget))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_api_key,
        ));
    let open = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::export_metrics));

    api.merge(open)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::track_metrics,
        ))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, bind: &str) -> EngineResult<()> {
    let app = router(state);
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| EngineError::Transient(format!("failed to bind {}: {}", bind, e)))?;

    info!("HTTP API listening on http://{}", bind);
    info!("  POST /event - ingest turnstile events");
    info!("  GET  /dau/:day - DP daily active users");
    info!("  GET  /mau?end=YYYY-MM-DD&window=N - DP monthly active users");
    info!("  GET  /budget/:metric - accountant snapshot");
    info!("  GET  /healthz - liveness probe");
    info!("  GET  /metrics - Prometheus exposition");

    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Transient(format!("server error: {}", e)))?;
    Ok(())
}
