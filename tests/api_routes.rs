// HTTP surface tests: routing, auth, rate limiting, error mapping and the
// Prometheus exposition, driven through the router without a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use dpau::api::{router, AppState};
use dpau::config::{AppConfig, SketchImpl};
use dpau::pipeline::Pipeline;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

fn test_config(dir: &TempDir) -> AppConfig {
    let mut cfg = AppConfig::with_required(dir.path().to_path_buf(), b"test-secret".to_vec());
    cfg.sketch_impl = SketchImpl::Set;
    cfg.default_seed = Some(42);
    cfg
}

fn app_with(cfg: AppConfig) -> Router {
    let pipeline = Pipeline::open(cfg).unwrap();
    let state = Arc::new(AppState::new(pipeline).unwrap());
    router(state)
}

fn app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let router = app_with(cfg);
    (dir, router)
}

fn post_events(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/event")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

const BATCH: &str = r#"{"events":[
    {"user_id":"u1","op":"+","day":"2025-10-01"},
    {"user_id":"u2","op":"+","day":"2025-10-01"}
]}"#;

#[tokio::test]
async fn test_ingest_returns_202_with_count() {
    let (_dir, app) = app();
    let response = app.oneshot(post_events(BATCH)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], 2);
}

#[tokio::test]
async fn test_dau_response_shape() {
    let (_dir, app) = app();
    app.clone().oneshot(post_events(BATCH)).await.unwrap();

    let response = app.oneshot(get("/dau/2025-10-01")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["day"], "2025-10-01");
    assert_eq!(body["raw"], 2.0);
    assert_eq!(body["mechanism"], "laplace");
    assert_eq!(body["sketch_impl"], "set");
    assert_eq!(body["epsilon_used"], 0.3);
    assert!(body["estimate"].is_u64());
    assert!(body["lower_95"].as_f64().unwrap() < body["upper_95"].as_f64().unwrap());
    assert!(body["version"].is_string());
    let budget = &body["budget"];
    assert_eq!(budget["release_count"], 1);
    assert_eq!(budget["epsilon_cap"], 3.0);
    assert!(budget["rdp_best"]["alpha"].is_number());
    assert!(budget["advanced"]["epsilon"].is_number());
}

#[tokio::test]
async fn test_mau_query_params() {
    let (_dir, app) = app();
    app.clone().oneshot(post_events(BATCH)).await.unwrap();

    let response = app
        .oneshot(get("/mau?end=2025-10-05&window=5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["raw"], 2.0);
    assert_eq!(body["window"], 5);
    assert_eq!(body["mechanism"], "gaussian");
}

#[tokio::test]
async fn test_bad_day_is_400() {
    let (_dir, app) = app();
    let response = app.oneshot(get("/dau/not-a-day")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_metric_is_400() {
    let (_dir, app) = app();
    let response = app.oneshot(get("/budget/wau")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_budget_snapshot_endpoint() {
    let (_dir, app) = app();
    app.clone().oneshot(post_events(BATCH)).await.unwrap();
    app.clone().oneshot(get("/dau/2025-10-01")).await.unwrap();

    let response = app
        .oneshot(get("/budget/dau?day=2025-10-01"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["metric"], "dau");
    assert_eq!(body["month"], "2025-10");
    assert_eq!(body["release_count"], 1);
    assert!((body["epsilon_spent"].as_f64().unwrap() - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_budget_exhaustion_maps_to_429() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.dau_budget_total = 0.3; // one release only
    let app = app_with(cfg);
    app.clone().oneshot(post_events(BATCH)).await.unwrap();

    let first = app.clone().oneshot(get("/dau/2025-10-01")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/dau/2025-10-01")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(second).await;
    assert_eq!(body["error"], "budget_exhausted");
    assert_eq!(body["metric"], "dau");
    assert_eq!(body["remaining"], 0.0);
    assert_eq!(body["reset_month"], "2025-11");
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.service_api_key = Some("sekrit".to_string());
    let app = app_with(cfg);

    let denied = app.clone().oneshot(post_events(BATCH)).await.unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let mut authed = post_events(BATCH);
    authed
        .headers_mut()
        .insert("x-api-key", "sekrit".parse().unwrap());
    let accepted = app.clone().oneshot(authed).await.unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    // probes stay open
    let health = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limiter_answers_429_with_retry_after() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.rate_limit_per_minute = 1;
    let app = app_with(cfg);

    let first = app.clone().oneshot(post_events(BATCH)).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app.oneshot(post_events(BATCH)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    let body = body_json(second).await;
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn test_healthz() {
    let (_dir, app) = app();
    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_exposition_counts_requests() {
    let (_dir, app) = app();
    app.clone().oneshot(get("/healthz")).await.unwrap();

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("app_requests_total"));
    assert!(text.contains("handler=\"/healthz\""));
    assert!(text.contains("app_request_latency_seconds_bucket"));
}

#[tokio::test]
async fn test_future_day_event_is_400() {
    let (_dir, app) = app();
    let future = chrono::Utc::now()
        .date_naive()
        .checked_add_days(chrono::Days::new(2))
        .unwrap();
    let body = format!(
        r#"{{"events":[{{"user_id":"u1","op":"+","day":"{}"}}]}}"#,
        future
    );
    let response = app.oneshot(post_events(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unparseable_json_is_client_error() {
    let (_dir, app) = app();
    let response = app.oneshot(post_events("{not json")).await.unwrap();
    assert!(response.status().is_client_error());
}
