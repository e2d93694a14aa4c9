// dpau: Runtime configuration
//
// Every knob has a default and an environment-variable override. DATA_DIR and
// HASH_SALT_SECRET are required when loading from the environment.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Sketch backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SketchImpl {
    Kmv,
    Set,
    Theta,
}

impl SketchImpl {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kmv" => Ok(SketchImpl::Kmv),
            "set" => Ok(SketchImpl::Set),
            "theta" => Ok(SketchImpl::Theta),
            "hllpp" => Err(EngineError::Validation(
                "sketch impl 'hllpp' cannot honor erasure diffs; use kmv, set or theta".to_string(),
            )),
            other => Err(EngineError::Validation(format!(
                "unknown sketch impl '{}', expected kmv, set or theta",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SketchImpl::Kmv => "kmv",
            SketchImpl::Set => "set",
            SketchImpl::Theta => "theta",
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub epsilon_dau: f64,
    pub epsilon_mau: f64,
    pub delta: f64,
    pub advanced_delta: f64,
    pub mau_window_days: u32,
    pub w_bound: u32,
    pub sketch_impl: SketchImpl,
    pub sketch_k: usize,
    pub use_bloom_for_diff: bool,
    pub bloom_fp_rate: f64,
    pub dau_budget_total: f64,
    pub mau_budget_total: f64,
    pub rdp_orders: Vec<f64>,
    #[serde(skip_serializing)]
    pub hash_salt_secret: Vec<u8>,
    pub hash_salt_rotation_days: u32,
    #[serde(skip_serializing)]
    pub service_api_key: Option<String>,
    pub default_seed: Option<u64>,
    pub timezone: String,
    pub rate_limit_per_minute: u32,
}

impl AppConfig {
    /// Configuration with defaults for everything except the two required
    /// fields. Used by tests and by `from_env`.
    pub fn with_required(data_dir: PathBuf, hash_salt_secret: Vec<u8>) -> Self {
        Self {
            data_dir,
            epsilon_dau: 0.3,
            epsilon_mau: 0.5,
            delta: 1e-6,
            advanced_delta: 1e-7,
            mau_window_days: 30,
            w_bound: 2,
            sketch_impl: SketchImpl::Kmv,
            sketch_k: 4096,
            use_bloom_for_diff: true,
            bloom_fp_rate: 0.01,
            dau_budget_total: 3.0,
            mau_budget_total: 3.5,
            rdp_orders: vec![2.0, 4.0, 8.0, 16.0, 32.0],
            hash_salt_secret,
            hash_salt_rotation_days: 30,
            service_api_key: None,
            default_seed: None,
            timezone: "UTC".to_string(),
            rate_limit_per_minute: 600,
        }
    }

    /// Load configuration from the environment.
    pub fn from_env() -> EngineResult<Self> {
        let data_dir = env::var("DATA_DIR")
            .map_err(|_| EngineError::Validation("DATA_DIR is required".to_string()))?;
        let secret = env::var("HASH_SALT_SECRET")
            .map_err(|_| EngineError::Validation("HASH_SALT_SECRET is required".to_string()))?;

        let mut cfg = Self::with_required(PathBuf::from(data_dir), secret.into_bytes());

        if let Some(v) = env_parse::<f64>("EPSILON_DAU")? {
            cfg.epsilon_dau = v;
        }
        if let Some(v) = env_parse::<f64>("EPSILON_MAU")? {
            cfg.epsilon_mau = v;
        }
        if let Some(v) = env_parse::<f64>("DELTA")? {
            cfg.delta = v;
        }
        if let Some(v) = env_parse::<f64>("ADVANCED_DELTA")? {
            cfg.advanced_delta = v;
        }
        if let Some(v) = env_parse::<u32>("MAU_WINDOW_DAYS")? {
            cfg.mau_window_days = v;
        }
        if let Some(v) = env_parse::<u32>("W_BOUND")? {
            cfg.w_bound = v;
        }
        if let Ok(v) = env::var("SKETCH_IMPL") {
            cfg.sketch_impl = SketchImpl::parse(&v)?;
        }
        if let Some(v) = env_parse::<usize>("SKETCH_K")? {
            cfg.sketch_k = v;
        }
        if let Some(v) = env_parse::<bool>("USE_BLOOM_FOR_DIFF")? {
            cfg.use_bloom_for_diff = v;
        }
        if let Some(v) = env_parse::<f64>("BLOOM_FP_RATE")? {
            cfg.bloom_fp_rate = v;
        }
        if let Some(v) = env_parse::<f64>("DAU_BUDGET_TOTAL")? {
            cfg.dau_budget_total = v;
        }
        if let Some(v) = env_parse::<f64>("MAU_BUDGET_TOTAL")? {
            cfg.mau_budget_total = v;
        }
        if let Ok(v) = env::var("RDP_ORDERS") {
            cfg.rdp_orders = parse_orders(&v)?;
        }
        if let Some(v) = env_parse::<u32>("HASH_SALT_ROTATION_DAYS")? {
            cfg.hash_salt_rotation_days = v;
        }
        if let Ok(v) = env::var("SERVICE_API_KEY") {
            if !v.is_empty() {
                cfg.service_api_key = Some(v);
            }
        }
        if let Some(v) = env_parse::<u64>("DEFAULT_SEED")? {
            cfg.default_seed = Some(v);
        }
        if let Ok(v) = env::var("TIMEZONE") {
            cfg.timezone = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_PER_MINUTE")? {
            cfg.rate_limit_per_minute = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> EngineResult<()> {
        if self.hash_salt_secret.is_empty() {
            return Err(EngineError::Validation(
                "HASH_SALT_SECRET must not be empty".to_string(),
            ));
        }
        if self.hash_salt_rotation_days < self.mau_window_days {
            return Err(EngineError::Validation(format!(
                "HASH_SALT_ROTATION_DAYS ({}) must be >= MAU_WINDOW_DAYS ({})",
                self.hash_salt_rotation_days, self.mau_window_days
            )));
        }
        if self.mau_window_days == 0 {
            return Err(EngineError::Validation(
                "MAU_WINDOW_DAYS must be positive".to_string(),
            ));
        }
        if self.epsilon_dau <= 0.0 || self.epsilon_mau <= 0.0 {
            return Err(EngineError::Validation(
                "epsilon values must be positive".to_string(),
            ));
        }
        if !(0.0 < self.delta && self.delta < 1.0) || !(0.0 < self.advanced_delta && self.advanced_delta < 1.0) {
            return Err(EngineError::Validation(
                "delta values must be in (0, 1)".to_string(),
            ));
        }
        if self.sketch_k < 2 {
            return Err(EngineError::Validation(
                "SKETCH_K must be at least 2".to_string(),
            ));
        }
        if !(0.0 < self.bloom_fp_rate && self.bloom_fp_rate < 1.0) {
            return Err(EngineError::Validation(
                "BLOOM_FP_RATE must be in (0, 1)".to_string(),
            ));
        }
        if self.rdp_orders.iter().any(|a| *a <= 1.0) {
            return Err(EngineError::Validation(
                "RDP orders must be > 1".to_string(),
            ));
        }
        if self.timezone != "UTC" {
            return Err(EngineError::Validation(format!(
                "unsupported TIMEZONE '{}', only UTC is supported",
                self.timezone
            )));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledgers").join("ledger.sled")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.data_dir.join("streams")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }
}

fn env_parse<T: FromStr>(name: &str) -> EngineResult<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw.parse::<T>().map(Some).map_err(|_| {
            EngineError::Validation(format!("invalid value '{}' for {}", raw, name))
        }),
        _ => Ok(None),
    }
}

fn parse_orders(raw: &str) -> EngineResult<Vec<f64>> {
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|_| EngineError::Validation(format!("invalid RDP order '{}'", s)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig::with_required(PathBuf::from("/tmp/dpau"), b"secret".to_vec())
    }

    #[test]
    fn test_defaults() {
        let cfg = base();
        assert_eq!(cfg.epsilon_dau, 0.3);
        assert_eq!(cfg.epsilon_mau, 0.5);
        assert_eq!(cfg.mau_window_days, 30);
        assert_eq!(cfg.w_bound, 2);
        assert_eq!(cfg.sketch_impl, SketchImpl::Kmv);
        assert_eq!(cfg.sketch_k, 4096);
        assert_eq!(cfg.rdp_orders, vec![2.0, 4.0, 8.0, 16.0, 32.0]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rotation_must_cover_window() {
        let mut cfg = base();
        cfg.hash_salt_rotation_days = 7;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_hllpp_rejected() {
        let err = SketchImpl::parse("hllpp").unwrap_err();
        assert!(err.to_string().contains("hllpp"));
        assert_eq!(SketchImpl::parse("THETA").unwrap(), SketchImpl::Theta);
    }

    #[test]
    fn test_parse_orders() {
        assert_eq!(parse_orders("2,4, 8").unwrap(), vec![2.0, 4.0, 8.0]);
        assert!(parse_orders("2,x").is_err());
    }

    #[test]
    fn test_layout_paths() {
        let cfg = base();
        assert!(cfg.ledger_path().ends_with("ledgers/ledger.sled"));
        assert!(cfg.streams_dir().ends_with("streams"));
    }
}
