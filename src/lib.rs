// dpau: Differentially private DAU/MAU analytics engine
//
// Publishes DP counts of distinct active users from a turnstile event stream
// while honoring retroactive user erasure: pseudonymized identities, per-day
// distinct-count sketches with deletion support, rolling-window unions,
// calibrated noise at release time and a persistent privacy-budget ledger.

// CRITICAL: Enforce proper error handling - no unwrap/expect in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod accountant;
pub mod api;
pub mod config;
pub mod dp;
pub mod error;
pub mod formats;
pub mod hashing;
pub mod ledger;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod sketch;
pub mod synth;
pub mod window;

pub use accountant::{Accountant, BudgetSnapshot};
pub use config::{AppConfig, SketchImpl};
pub use error::{EngineError, EngineResult};
pub use ledger::{Ledger, Metric, Op};
pub use pipeline::{Event, Pipeline, ReleaseOutput};
