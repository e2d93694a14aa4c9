// dpau: Theta sampling sketch
//
// Retains every hash below an adaptive threshold theta. While theta is still
// 2^64 the count is exact; once the retained set outgrows the nominal
// capacity, theta shrinks to the largest retained hash and the estimate is
// |S| / (theta / 2^64). Unlike KMV the estimate has no (k-1) correction, and
// the threshold survives unions and diffs directly.

use super::RemovedFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const HASH_SPACE: f64 = 18_446_744_073_709_551_616.0; // 2^64

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaSketch {
    nominal: usize,
    theta: u64,
    hashes: BTreeSet<u64>,
    #[serde(default)]
    approx: bool,
}

impl ThetaSketch {
    pub fn new(nominal: usize) -> Self {
        Self {
            nominal: nominal.max(2),
            theta: u64::MAX,
            hashes: BTreeSet::new(),
            approx: false,
        }
    }

    pub fn retained(&self) -> usize {
        self.hashes.len()
    }

    pub fn approximate_diffed(&self) -> bool {
        self.approx
    }

    fn shrink_to_nominal(&mut self) {
        while self.hashes.len() > self.nominal {
            if let Some(max) = self.hashes.iter().next_back().copied() {
                self.hashes.remove(&max);
                self.theta = max;
            }
        }
    }

    pub fn insert(&mut self, h: u64) {
        if h >= self.theta {
            return;
        }
        self.hashes.insert(h);
        self.shrink_to_nominal();
    }

    pub fn cardinality(&self) -> f64 {
        if self.theta == u64::MAX {
            return self.hashes.len() as f64;
        }
        let theta = (self.theta as f64).max(1.0);
        self.hashes.len() as f64 * HASH_SPACE / theta
    }

    pub fn union(&self, other: &ThetaSketch) -> ThetaSketch {
        let theta = self.theta.min(other.theta);
        let mut merged = ThetaSketch {
            nominal: self.nominal.max(other.nominal),
            theta,
            hashes: BTreeSet::new(),
            approx: self.approx || other.approx,
        };
        for h in self.hashes.iter().chain(other.hashes.iter()) {
            if *h < theta {
                merged.hashes.insert(*h);
            }
        }
        merged.shrink_to_nominal();
        merged
    }

    pub fn diff(&self, removed: &RemovedFilter) -> ThetaSketch {
        ThetaSketch {
            nominal: self.nominal,
            theta: self.theta,
            hashes: self
                .hashes
                .iter()
                .filter(|h| !removed.contains(**h))
                .copied()
                .collect(),
            approx: self.approx || removed.approximate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_exact_until_capacity() {
        let mut sk = ThetaSketch::new(64);
        for h in 0..40u64 {
            sk.insert(h.wrapping_mul(0x9e3779b97f4a7c15));
        }
        assert_eq!(sk.cardinality(), 40.0);
    }

    #[test]
    fn test_estimates_after_saturation() {
        let mut rng = StdRng::seed_from_u64(13);
        let n = 30_000usize;
        let mut sk = ThetaSketch::new(1024);
        for _ in 0..n {
            sk.insert(rng.gen());
        }
        let rel_err = (sk.cardinality() - n as f64).abs() / n as f64;
        assert!(rel_err < 0.15, "relative error {}", rel_err);
    }

    #[test]
    fn test_union_keeps_min_theta() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut a = ThetaSketch::new(256);
        let mut b = ThetaSketch::new(256);
        for _ in 0..5000 {
            a.insert(rng.gen());
        }
        for _ in 0..50 {
            b.insert(rng.gen());
        }
        let u = a.union(&b);
        assert!(u.theta <= a.theta && u.theta <= b.theta);
        assert!(u.cardinality() >= a.cardinality() * 0.8);
    }

    #[test]
    fn test_diff_removes() {
        let mut sk = ThetaSketch::new(64);
        let keys: Vec<u64> = (1..=8u64).map(|h| h.wrapping_mul(0x9e3779b97f4a7c15)).collect();
        for h in &keys {
            sk.insert(*h);
        }
        let removed = RemovedFilter::exact(keys[..2].to_vec());
        assert_eq!(sk.diff(&removed).cardinality(), 6.0);
    }
}
