// dpau: KMV bottom-k distinct-count sketch
//
// Retains the k smallest 64-bit hashes seen. Below k distinct inserts the
// count is exact; at saturation the k-th smallest hash t_k estimates the
// density of the hash space and cardinality is (k-1)/t_k scaled to 2^64.
//
// A diff on a saturated sketch freezes the sampling threshold: the surviving
// hashes remain a uniform sample of the hash space below t_k, so the
// estimator switches to |S| / (t_k / 2^64). Erasure may therefore carry the
// documented additive bias when the removed filter is approximate.
//
// A thresholded sketch keeps absorbing inserts below the threshold and
// downsamples (shrinking the threshold) when the sample overflows capacity.
// An insert at or above the threshold cannot be represented; `insert`
// reports it so the owner can rebuild the day from the activity log.

use super::RemovedFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const HASH_SPACE: f64 = 18_446_744_073_709_551_616.0; // 2^64

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmvSketch {
    k: usize,
    hashes: BTreeSet<u64>,
    threshold: Option<u64>,
    #[serde(default)]
    approx: bool,
}

impl KmvSketch {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(2),
            hashes: BTreeSet::new(),
            threshold: None,
            approx: false,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn retained(&self) -> usize {
        self.hashes.len()
    }

    pub fn approximate_diffed(&self) -> bool {
        self.approx
    }

    fn max_retained(&self) -> Option<u64> {
        self.hashes.iter().next_back().copied()
    }

    // Sampling threshold in effect: frozen by a saturated diff, otherwise the
    // k-th smallest hash once the sketch is full.
    fn effective_threshold(&self) -> Option<u64> {
        if self.threshold.is_some() {
            return self.threshold;
        }
        if self.hashes.len() >= self.k {
            self.max_retained()
        } else {
            None
        }
    }

    /// Record one key hash. Returns false when the hash lies at or above a
    /// frozen sampling threshold: the sketch cannot represent it and the
    /// caller must reconstruct the day from its audit log.
    pub fn insert(&mut self, h: u64) -> bool {
        if let Some(t) = self.threshold {
            if self.hashes.contains(&h) {
                return true;
            }
            if h >= t {
                return false;
            }
            // Below-threshold keys join the sample; overflow downsamples by
            // shrinking the threshold so the estimator stays unbiased.
            self.hashes.insert(h);
            if self.hashes.len() > self.k {
                if let Some(max) = self.max_retained() {
                    self.hashes.remove(&max);
                    self.threshold = Some(max);
                }
            }
            return true;
        }
        if self.hashes.contains(&h) {
            return true;
        }
        if self.hashes.len() < self.k {
            self.hashes.insert(h);
            return true;
        }
        if let Some(max) = self.max_retained() {
            if h < max {
                self.hashes.insert(h);
                self.hashes.remove(&max);
            }
        }
        true
    }

    pub fn cardinality(&self) -> f64 {
        if let Some(t) = self.threshold {
            let t = (t as f64).max(1.0);
            return self.hashes.len() as f64 * HASH_SPACE / t;
        }
        if self.hashes.len() < self.k {
            return self.hashes.len() as f64;
        }
        match self.max_retained() {
            Some(t_k) => {
                let t_k = (t_k as f64).max(1.0);
                (self.k as f64 - 1.0) * HASH_SPACE / t_k
            }
            None => 0.0,
        }
    }

    pub fn union(&self, other: &KmvSketch) -> KmvSketch {
        let k = self.k.max(other.k);
        let cut = match (self.effective_threshold(), other.effective_threshold()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        let mut merged: BTreeSet<u64> = BTreeSet::new();
        for h in self.hashes.iter().chain(other.hashes.iter()) {
            if cut.map_or(true, |c| *h < c) {
                merged.insert(*h);
            }
        }
        let threshold = if merged.len() > k {
            // Trim back to the k smallest; the bottom-k sample is a plain KMV
            // sample again and the (k-1)/t_k estimator applies.
            while merged.len() > k {
                if let Some(max) = merged.iter().next_back().copied() {
                    merged.remove(&max);
                }
            }
            None
        } else {
            cut.filter(|_| self.threshold.is_some() || other.threshold.is_some())
        };
        KmvSketch {
            k,
            hashes: merged,
            threshold,
            approx: self.approx || other.approx,
        }
    }

    pub fn diff(&self, removed: &RemovedFilter) -> KmvSketch {
        let threshold = self.effective_threshold();
        // The sample is everything strictly below the threshold; the order
        // statistic defining t_k itself stays outside it, matching insert
        // and union.
        let hashes: BTreeSet<u64> = self
            .hashes
            .iter()
            .filter(|h| threshold.map_or(true, |t| **h < t) && !removed.contains(**h))
            .copied()
            .collect();
        KmvSketch {
            k: self.k,
            hashes,
            threshold,
            approx: self.approx || removed.approximate(),
        }
    }
}
