// dpau: API request/response models

use crate::accountant::BudgetSnapshot;
use crate::error::{EngineError, EngineResult};
use crate::formats::parse_day;
use crate::ledger::Op;
use crate::pipeline::{Event, ReleaseOutput};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct EventDto {
    pub user_id: String,
    pub op: String,
    pub day: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl EventDto {
    pub fn into_event(self) -> EngineResult<Event> {
        Ok(Event {
            user_id: self.user_id,
            op: Op::parse(&self.op)?,
            day: parse_day(&self.day)?,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<EventDto>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

#[derive(Debug, Deserialize)]
pub struct MauParams {
    pub end: String,
    #[serde(default)]
    pub window: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BudgetParams {
    #[serde(default)]
    pub day: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RdpBestBody {
    pub alpha: f64,
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Serialize)]
pub struct AdvancedBody {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Serialize)]
pub struct BudgetBody {
    pub epsilon_spent: f64,
    pub epsilon_remaining: f64,
    pub epsilon_cap: f64,
    pub rdp_best: RdpBestBody,
    pub advanced: AdvancedBody,
    pub release_count: u64,
}

impl From<&BudgetSnapshot> for BudgetBody {
    fn from(snap: &BudgetSnapshot) -> Self {
        Self {
            epsilon_spent: snap.epsilon_spent,
            epsilon_remaining: snap.epsilon_remaining,
            epsilon_cap: snap.epsilon_cap,
            rdp_best: RdpBestBody {
                alpha: snap.rdp_best.alpha,
                epsilon: snap.rdp_best.epsilon,
                delta: snap.rdp_best.delta,
            },
            advanced: AdvancedBody {
                epsilon: snap.advanced.epsilon,
                delta: snap.advanced.delta,
            },
            release_count: snap.release_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub day: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    pub estimate: u64,
    /// The pre-noise count; exposed only in seeded (deterministic) mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<f64>,
    pub lower_95: f64,
    pub upper_95: f64,
    pub epsilon_used: f64,
    pub delta: f64,
    pub mechanism: String,
    pub sketch_impl: String,
    pub diff_bias_bounded: bool,
    pub budget_remaining: f64,
    pub version: String,
    pub budget: BudgetBody,
}

impl ReleaseResponse {
    pub fn from_output(out: &ReleaseOutput, include_raw: bool) -> Self {
        Self {
            day: out.day.to_string(),
            window: (out.window_days > 1).then_some(out.window_days),
            estimate: out.estimate,
            raw: include_raw.then_some(out.raw),
            lower_95: out.ci_low,
            upper_95: out.ci_high,
            epsilon_used: out.epsilon,
            delta: out.delta,
            mechanism: out.mechanism.as_str().to_string(),
            sketch_impl: out.sketch_impl.as_str().to_string(),
            diff_bias_bounded: out.diff_bias_bounded,
            budget_remaining: out.budget.epsilon_remaining,
            version: env!("CARGO_PKG_VERSION").to_string(),
            budget: BudgetBody::from(&out.budget),
        }
    }
}

/// Map an engine error onto its transport status and JSON body.
pub fn error_response(err: &EngineError) -> Response {
    match err {
        EngineError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "validation", "detail": msg })),
        )
            .into_response(),
        EngineError::Auth(msg) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized", "detail": msg })),
        )
            .into_response(),
        EngineError::RateLimited { retry_after_secs } => (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(serde_json::json!({ "error": "rate_limited" })),
        )
            .into_response(),
        EngineError::BudgetExhausted(info) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "budget_exhausted",
                "metric": info.metric,
                "cap": info.cap,
                "spent": info.spent,
                "remaining": info.remaining,
                "reset_month": info.reset_month,
            })),
        )
            .into_response(),
        EngineError::Conflict(msg) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "conflict", "detail": msg })),
        )
            .into_response(),
        EngineError::Transient(msg) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "transient", "detail": msg })),
        )
            .into_response(),
        EngineError::Fatal(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "internal", "detail": msg })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BudgetExhaustedInfo;

    #[test]
    fn test_event_dto_validation() {
        let good = EventDto {
            user_id: "u1".into(),
            op: "+".into(),
            day: "2025-10-01".into(),
            metadata: None,
        };
        assert!(good.into_event().is_ok());
        let bad = EventDto {
            user_id: "u1".into(),
            op: "add".into(),
            day: "2025-10-01".into(),
            metadata: None,
        };
        assert!(bad.into_event().is_err());
    }

    #[test]
    fn test_budget_exhausted_maps_to_429() {
        let resp = error_response(&EngineError::BudgetExhausted(BudgetExhaustedInfo {
            metric: "dau".into(),
            cap: 3.0,
            spent: 3.0,
            remaining: 0.0,
            reset_month: "2025-11".into(),
        }));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let resp = error_response(&EngineError::RateLimited {
            retry_after_secs: 17,
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("17")
        );
    }
}
