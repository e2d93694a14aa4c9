// dpau: Error types

use serde::Serialize;
use thiserror::Error;

/// Engine result type
pub type EngineResult<T> = Result<T, EngineError>;

/// Structured payload attached to a budget-exhausted rejection.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetExhaustedInfo {
    pub metric: String,
    pub cap: f64,
    pub spent: f64,
    pub remaining: f64,
    pub reset_month: String,
}

/// Engine error kinds, independent of transport.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Budget exhausted for {}: spent {:.4} of cap {:.4}", .0.metric, .0.spent, .0.cap)]
    BudgetExhausted(BudgetExhaustedInfo),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Fatal invariant violation: {0}")]
    Fatal(String),
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Transient(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        // A value that fails to (de)serialize means the ledger holds state we
        // cannot interpret; retrying will not help.
        EngineError::Fatal(format!("ledger value codec error: {}", err))
    }
}

/// Check if an error is transient and worth one internal retry.
pub fn is_retryable_error(err: &EngineError) -> bool {
    matches!(err, EngineError::Transient(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausted_message() {
        let err = EngineError::BudgetExhausted(BudgetExhaustedInfo {
            metric: "dau".to_string(),
            cap: 3.0,
            spent: 3.0,
            remaining: 0.0,
            reset_month: "2025-11".to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("dau"));
        assert!(msg.contains("3.0"));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(is_retryable_error(&EngineError::Transient("io".into())));
        assert!(!is_retryable_error(&EngineError::Validation("bad".into())));
        assert!(!is_retryable_error(&EngineError::Fatal("bug".into())));
    }
}
