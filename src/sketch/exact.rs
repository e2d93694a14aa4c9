// dpau: Exact distinct-count backend
//
// Stores every key hash. Memory is linear in the number of distinct users;
// intended for tests and regulated modes where sketch error is unacceptable.

use super::RemovedFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExactSketch {
    hashes: BTreeSet<u64>,
    #[serde(default)]
    approx: bool,
}

impl ExactSketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, h: u64) {
        self.hashes.insert(h);
    }

    pub fn cardinality(&self) -> f64 {
        self.hashes.len() as f64
    }

    pub fn union(&self, other: &ExactSketch) -> ExactSketch {
        ExactSketch {
            hashes: self.hashes.union(&other.hashes).copied().collect(),
            approx: self.approx || other.approx,
        }
    }

    pub fn diff(&self, removed: &RemovedFilter) -> ExactSketch {
        ExactSketch {
            hashes: self
                .hashes
                .iter()
                .filter(|h| !removed.contains(**h))
                .copied()
                .collect(),
            approx: self.approx || removed.approximate(),
        }
    }

    pub fn contains(&self, h: u64) -> bool {
        self.hashes.contains(&h)
    }

    pub fn approximate_diffed(&self) -> bool {
        self.approx
    }
}
