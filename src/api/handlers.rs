// dpau: HTTP route handlers

use crate::api::models::{
    error_response, BudgetParams, IngestRequest, IngestResponse, MauParams, ReleaseResponse,
};
use crate::api::server::AppState;
use crate::error::EngineError;
use crate::formats::parse_day;
use crate::ledger::Metric;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

// Pipeline operations block on the writer lock and the ledger, so they run
// on the blocking worker pool instead of the async runtime threads.
async fn run_blocking<T, F>(task: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| EngineError::Fatal(format!("worker pool: {}", e)))?
}

/// Accept a batch of turnstile events.
pub async fn ingest_events(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Response {
    if let Err(err) = state.limiter.try_acquire() {
        return error_response(&err);
    }
    let mut events = Vec::with_capacity(request.events.len());
    for dto in request.events {
        match dto.into_event() {
            Ok(event) => events.push(event),
            Err(err) => return error_response(&err),
        }
    }
    let worker_state = state.clone();
    match run_blocking(move || worker_state.pipeline.ingest(&events)).await {
        Ok(accepted) => {
            (StatusCode::ACCEPTED, Json(IngestResponse { accepted })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// DP daily active users for one day.
pub async fn get_dau(State(state): State<Arc<AppState>>, Path(day): Path<String>) -> Response {
    let day = match parse_day(&day) {
        Ok(day) => day,
        Err(err) => return error_response(&err),
    };
    let worker_state = state.clone();
    match run_blocking(move || worker_state.pipeline.release_dau(day)).await {
        Ok(out) => {
            let include_raw = state.pipeline.config().default_seed.is_some();
            Json(ReleaseResponse::from_output(&out, include_raw)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// DP monthly active users over a rolling window.
pub async fn get_mau(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MauParams>,
) -> Response {
    let end = match parse_day(&params.end) {
        Ok(day) => day,
        Err(err) => return error_response(&err),
    };
    let window = params.window;
    let worker_state = state.clone();
    match run_blocking(move || worker_state.pipeline.release_mau(end, window)).await {
        Ok(out) => {
            let include_raw = state.pipeline.config().default_seed.is_some();
            Json(ReleaseResponse::from_output(&out, include_raw)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// Accountant snapshot for a metric's month.
pub async fn get_budget(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
    Query(params): Query<BudgetParams>,
) -> Response {
    let metric = match Metric::parse(&metric) {
        Ok(metric) => metric,
        Err(err) => return error_response(&err),
    };
    let day = match params.day {
        Some(raw) => match parse_day(&raw) {
            Ok(day) => day,
            Err(err) => return error_response(&err),
        },
        None => Utc::now().date_naive(),
    };
    match state.pipeline.budget_snapshot(metric, day) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Liveness probe.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if state.pipeline.healthy() {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        )
            .into_response()
    }
}

/// Prometheus text exposition.
pub async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => body.into_response(),
        Err(err) => error_response(&err),
    }
}

/// Shared-secret header check applied to the JSON API routes.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.pipeline.config().service_api_key {
        let provided = req
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(&EngineError::Auth(
                "missing or invalid X-API-Key".to_string(),
            ));
        }
    }
    next.run(req).await
}

/// Request counters and latency histogram around every route.
pub async fn track_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let handler = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let start = Instant::now();
    let response = next.run(req).await;
    state.metrics.observe(
        &handler,
        &method,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
