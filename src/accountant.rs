// dpau: Privacy budget accounting
//
// Tracks per-(metric, month) spend three ways: a naive sum of epsilons
// (enforced against the monthly cap), Renyi-DP totals over a fixed order
// grid, and the advanced composition bound. Admission is strict: a release
// that would push the naive sum past the cap is rejected before any noise is
// drawn.

use crate::config::AppConfig;
use crate::dp::{gaussian_sigma, Mechanism};
use crate::error::{BudgetExhaustedInfo, EngineError, EngineResult};
use crate::ledger::{BudgetEntry, Ledger, Metric, RdpPoint};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;

// Slack for accumulated floating-point error in the naive sum.
const CAP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize)]
pub struct RdpBest {
    pub alpha: f64,
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedBound {
    pub epsilon: f64,
    pub delta: f64,
}

/// Point-in-time accountant state for one (metric, month).
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub metric: Metric,
    pub month: String,
    pub epsilon_spent: f64,
    pub epsilon_remaining: f64,
    pub epsilon_cap: f64,
    pub release_count: u64,
    pub rdp: Vec<RdpPoint>,
    pub rdp_best: RdpBest,
    pub advanced: AdvancedBound,
}

pub struct Accountant {
    orders: Vec<f64>,
    dau_cap: f64,
    mau_cap: f64,
    delta: f64,
    advanced_delta: f64,
}

/// Month bucket for a release day, `YYYY-MM`.
pub fn month_of(day: NaiveDate) -> String {
    format!("{:04}-{:02}", day.year(), day.month())
}

/// The month after `YYYY-MM`, when the budget resets.
pub fn next_month(month: &str) -> EngineResult<String> {
    let day = NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d")
        .map_err(|_| EngineError::Validation(format!("invalid month '{}'", month)))?;
    let (y, m) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    Ok(format!("{:04}-{:02}", y, m))
}

impl Accountant {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            orders: cfg.rdp_orders.clone(),
            dau_cap: cfg.dau_budget_total,
            mau_cap: cfg.mau_budget_total,
            delta: cfg.delta,
            advanced_delta: cfg.advanced_delta,
        }
    }

    pub fn cap(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dau => self.dau_cap,
            Metric::Mau => self.mau_cap,
        }
    }

    // Laplace releases are pure epsilon-DP; only the Gaussian mechanism
    // carries a per-release delta.
    fn mechanism_delta(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dau => 0.0,
            Metric::Mau => self.delta,
        }
    }

    /// Check the monthly cap and hand back the entry the release will charge.
    /// Rejection carries the structured exhaustion payload and leaves no
    /// trace in the ledger.
    pub fn admit(
        &self,
        ledger: &Ledger,
        metric: Metric,
        month: &str,
        epsilon: f64,
    ) -> EngineResult<BudgetEntry> {
        let entry = ledger
            .budget(metric, month)?
            .unwrap_or_else(|| BudgetEntry::empty(metric, month, &self.orders));
        if entry.naive_spent < 0.0 {
            return Err(EngineError::Fatal(format!(
                "negative budget spend {} for {} {}",
                entry.naive_spent, metric, month
            )));
        }
        let cap = self.cap(metric);
        if entry.naive_spent + epsilon > cap + CAP_TOLERANCE {
            return Err(EngineError::BudgetExhausted(BudgetExhaustedInfo {
                metric: metric.as_str().to_string(),
                cap,
                spent: entry.naive_spent,
                remaining: (cap - entry.naive_spent).max(0.0),
                reset_month: next_month(month)?,
            }));
        }
        Ok(entry)
    }

    /// Per-release RDP contribution over the configured order grid.
    pub fn rdp_contribution(
        &self,
        mechanism: Mechanism,
        epsilon: f64,
        delta: f64,
        sensitivity: f64,
    ) -> Vec<RdpPoint> {
        self.orders
            .iter()
            .map(|alpha| RdpPoint {
                alpha: *alpha,
                epsilon: match mechanism {
                    Mechanism::Gaussian => {
                        let sigma = gaussian_sigma(sensitivity, epsilon, delta);
                        alpha * sensitivity * sensitivity / (2.0 * sigma * sigma)
                    }
                    Mechanism::Laplace => laplace_rdp(*alpha, epsilon),
                },
            })
            .collect()
    }

    /// Fold one admitted release into the entry.
    pub fn charge(&self, entry: &mut BudgetEntry, epsilon: f64, contribution: &[RdpPoint]) {
        entry.naive_spent += epsilon;
        entry.release_count += 1;
        entry.epsilons.push(epsilon);
        for point in contribution {
            match entry
                .rdp_log
                .iter_mut()
                .find(|p| (p.alpha - point.alpha).abs() < f64::EPSILON)
            {
                Some(existing) => existing.epsilon += point.epsilon,
                None => entry.rdp_log.push(*point),
            }
        }
    }

    /// Side-effect-free view of the accountant state.
    pub fn snapshot(
        &self,
        ledger: &Ledger,
        metric: Metric,
        month: &str,
    ) -> EngineResult<BudgetSnapshot> {
        let entry = ledger
            .budget(metric, month)?
            .unwrap_or_else(|| BudgetEntry::empty(metric, month, &self.orders));
        Ok(self.snapshot_of(&entry))
    }

    /// Snapshot computed from an in-hand entry (used while the release batch
    /// that wrote the entry is being assembled).
    pub fn snapshot_of(&self, entry: &BudgetEntry) -> BudgetSnapshot {
        let cap = self.cap(entry.metric);
        BudgetSnapshot {
            metric: entry.metric,
            month: entry.month.clone(),
            epsilon_spent: entry.naive_spent,
            epsilon_remaining: (cap - entry.naive_spent).max(0.0),
            epsilon_cap: cap,
            release_count: entry.release_count,
            rdp: entry.rdp_log.clone(),
            rdp_best: self.best_rdp(entry),
            advanced: self.advanced_bound(entry),
        }
    }

    // Convert the RDP curve into the best (epsilon, delta) pair at the target
    // delta: epsilon(alpha) = rdp(alpha) + ln(1/delta) / (alpha - 1).
    fn best_rdp(&self, entry: &BudgetEntry) -> RdpBest {
        let delta = self.delta;
        if entry.release_count == 0 {
            let alpha = self.orders.last().copied().unwrap_or(2.0);
            return RdpBest {
                alpha,
                epsilon: 0.0,
                delta,
            };
        }
        let log_term = (1.0 / delta).ln();
        entry
            .rdp_log
            .iter()
            .map(|p| RdpBest {
                alpha: p.alpha,
                epsilon: p.epsilon + log_term / (p.alpha - 1.0),
                delta,
            })
            .min_by(|a, b| a.epsilon.total_cmp(&b.epsilon))
            .unwrap_or(RdpBest {
                alpha: 2.0,
                epsilon: 0.0,
                delta,
            })
    }

    // Advanced composition over k releases at the largest per-release
    // epsilon (conservative when releases are heterogeneous):
    //   eps_adv = eps sqrt(2k ln(1/delta')) + k eps (e^eps - 1)
    //   delta_total = k delta + delta'
    fn advanced_bound(&self, entry: &BudgetEntry) -> AdvancedBound {
        let k = entry.release_count as f64;
        if entry.release_count == 0 {
            return AdvancedBound {
                epsilon: 0.0,
                delta: self.advanced_delta,
            };
        }
        let eps_base = entry.epsilons.iter().copied().fold(0.0f64, f64::max);
        let epsilon = eps_base * (2.0 * k * (1.0 / self.advanced_delta).ln()).sqrt()
            + k * eps_base * (eps_base.exp() - 1.0);
        let delta = k * self.mechanism_delta(entry.metric) + self.advanced_delta;
        AdvancedBound { epsilon, delta }
    }

    pub fn reset_entry(&self, metric: Metric, month: &str) -> BudgetEntry {
        BudgetEntry::empty(metric, month, &self.orders)
    }
}

// Renyi divergence of order alpha between two Laplace(1/eps-scaled)
// distributions shifted by the sensitivity (Mironov, Table II), capped at
// the pure-DP bound eps which every order must respect.
fn laplace_rdp(alpha: f64, eps: f64) -> f64 {
    let a = alpha;
    let inner = (a / (2.0 * a - 1.0)) * ((a - 1.0) * eps).exp()
        + ((a - 1.0) / (2.0 * a - 1.0)) * (-a * eps).exp();
    let mironov = inner.ln() / (a - 1.0);
    mironov.min(eps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Ledger, Accountant) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.sled")).unwrap();
        let cfg = AppConfig::with_required(PathBuf::from(dir.path()), b"s".to_vec());
        let accountant = Accountant::new(&cfg);
        (dir, ledger, accountant)
    }

    fn commit_entry(ledger: &Ledger, entry: &BudgetEntry) {
        let mut wb = ledger.begin();
        ledger.stage_budget(&mut wb, entry).unwrap();
        ledger.commit(wb).unwrap();
    }

    #[test]
    fn test_month_helpers() {
        let d = NaiveDate::parse_from_str("2025-12-31", "%Y-%m-%d").unwrap();
        assert_eq!(month_of(d), "2025-12");
        assert_eq!(next_month("2025-12").unwrap(), "2026-01");
        assert_eq!(next_month("2025-10").unwrap(), "2025-11");
        assert!(next_month("october").is_err());
    }

    #[test]
    fn test_cap_admits_exactly_ten_dau_releases() {
        let (_dir, ledger, acct) = setup();
        let month = "2025-10";
        for i in 0..10 {
            let mut entry = acct
                .admit(&ledger, Metric::Dau, month, 0.3)
                .unwrap_or_else(|e| panic!("release {} rejected: {}", i, e));
            let rdp = acct.rdp_contribution(Mechanism::Laplace, 0.3, 0.0, 2.0);
            acct.charge(&mut entry, 0.3, &rdp);
            assert!(entry.naive_spent <= acct.cap(Metric::Dau) + 1e-9);
            commit_entry(&ledger, &entry);
        }
        let err = acct.admit(&ledger, Metric::Dau, month, 0.3).unwrap_err();
        match err {
            EngineError::BudgetExhausted(info) => {
                assert_eq!(info.metric, "dau");
                assert!(info.remaining < 1e-9);
                assert_eq!(info.reset_month, "2025-11");
            }
            other => panic!("expected exhaustion, got {}", other),
        }
    }

    #[test]
    fn test_release_count_matches_admissions() {
        let (_dir, ledger, acct) = setup();
        for _ in 0..4 {
            let mut entry = acct.admit(&ledger, Metric::Mau, "2025-10", 0.5).unwrap();
            let rdp = acct.rdp_contribution(Mechanism::Gaussian, 0.5, 1e-6, 2.0);
            acct.charge(&mut entry, 0.5, &rdp);
            commit_entry(&ledger, &entry);
        }
        let snap = acct.snapshot(&ledger, Metric::Mau, "2025-10").unwrap();
        assert_eq!(snap.release_count, 4);
        assert!((snap.epsilon_spent - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rdp_totals_monotone_under_composition() {
        let (_dir, ledger, acct) = setup();
        let mut previous: Option<Vec<f64>> = None;
        for _ in 0..5 {
            let mut entry = acct.admit(&ledger, Metric::Dau, "2025-10", 0.3).unwrap();
            let rdp = acct.rdp_contribution(Mechanism::Laplace, 0.3, 0.0, 2.0);
            acct.charge(&mut entry, 0.3, &rdp);
            commit_entry(&ledger, &entry);
            let totals: Vec<f64> = entry.rdp_log.iter().map(|p| p.epsilon).collect();
            if let Some(prev) = &previous {
                for (now, before) in totals.iter().zip(prev) {
                    assert!(now >= before);
                }
            }
            previous = Some(totals);
        }
    }

    #[test]
    fn test_laplace_rdp_bounded_by_pure_epsilon() {
        for alpha in [2.0, 4.0, 8.0, 16.0, 32.0] {
            let rdp = laplace_rdp(alpha, 0.3);
            assert!(rdp > 0.0);
            assert!(rdp <= 0.3 + 1e-12, "alpha {} gave {}", alpha, rdp);
        }
    }

    #[test]
    fn test_gaussian_rdp_scales_linearly_in_alpha() {
        let (_dir, _ledger, acct) = setup();
        let points = acct.rdp_contribution(Mechanism::Gaussian, 0.5, 1e-6, 2.0);
        let base = points[0].epsilon / points[0].alpha;
        for p in &points {
            assert!((p.epsilon / p.alpha - base).abs() < 1e-12);
        }
    }

    #[test]
    fn test_snapshot_is_side_effect_free() {
        let (_dir, ledger, acct) = setup();
        let a = acct.snapshot(&ledger, Metric::Dau, "2025-10").unwrap();
        let b = acct.snapshot(&ledger, Metric::Dau, "2025-10").unwrap();
        assert_eq!(a.release_count, 0);
        assert_eq!(b.epsilon_spent, 0.0);
        assert!(ledger.budget(Metric::Dau, "2025-10").unwrap().is_none());
    }

    #[test]
    fn test_reset_zeroes_entry() {
        let (_dir, ledger, acct) = setup();
        let mut entry = acct.admit(&ledger, Metric::Dau, "2025-10", 0.3).unwrap();
        let rdp = acct.rdp_contribution(Mechanism::Laplace, 0.3, 0.0, 2.0);
        acct.charge(&mut entry, 0.3, &rdp);
        commit_entry(&ledger, &entry);
        let zeroed = acct.reset_entry(Metric::Dau, "2025-10");
        commit_entry(&ledger, &zeroed);
        let snap = acct.snapshot(&ledger, Metric::Dau, "2025-10").unwrap();
        assert_eq!(snap.epsilon_spent, 0.0);
        assert_eq!(snap.release_count, 0);
    }
}
