// dpau: Distinct-count sketches with union, cardinality and deletion support

pub mod bloom;
pub mod exact;
pub mod kmv;
pub mod theta;

pub use bloom::BloomFilter;
pub use exact::ExactSketch;
pub use kmv::KmvSketch;
pub use theta::ThetaSketch;

use crate::config::SketchImpl;
use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Above this many removed keys the filter switches to a Bloom filter when
/// the approximate path is enabled.
const EXACT_FILTER_MAX: usize = 1024;

/// Membership filter over removed key hashes.
#[derive(Debug, Clone)]
pub enum RemovedFilter {
    Exact(HashSet<u64>),
    Bloom(BloomFilter),
}

impl RemovedFilter {
    pub fn exact(removed: Vec<u64>) -> Self {
        RemovedFilter::Exact(removed.into_iter().collect())
    }

    /// Exact set when small, Bloom filter above the threshold when the
    /// approximate path is enabled.
    pub fn build(removed: &[u64], use_bloom: bool, fp_rate: f64) -> Self {
        if use_bloom && removed.len() > EXACT_FILTER_MAX {
            let mut bloom = BloomFilter::with_fp_rate(removed.len(), fp_rate);
            for h in removed {
                bloom.insert(*h);
            }
            RemovedFilter::Bloom(bloom)
        } else {
            RemovedFilter::Exact(removed.iter().copied().collect())
        }
    }

    pub fn contains(&self, h: u64) -> bool {
        match self {
            RemovedFilter::Exact(set) => set.contains(&h),
            RemovedFilter::Bloom(bloom) => bloom.contains(h),
        }
    }

    /// True when membership answers may over-delete.
    pub fn approximate(&self) -> bool {
        matches!(self, RemovedFilter::Bloom(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RemovedFilter::Exact(set) => set.is_empty(),
            RemovedFilter::Bloom(_) => false,
        }
    }
}

/// Per-day distinct-count sketch; tagged dispatch over the three backends.
/// All backends are deterministic under the same insertion multiset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "impl", rename_all = "lowercase")]
pub enum DaySketch {
    Kmv(KmvSketch),
    Set(ExactSketch),
    Theta(ThetaSketch),
}

impl DaySketch {
    pub fn new(kind: SketchImpl, k: usize) -> Self {
        match kind {
            SketchImpl::Kmv => DaySketch::Kmv(KmvSketch::new(k)),
            SketchImpl::Set => DaySketch::Set(ExactSketch::new()),
            SketchImpl::Theta => DaySketch::Theta(ThetaSketch::new(k)),
        }
    }

    pub fn kind(&self) -> SketchImpl {
        match self {
            DaySketch::Kmv(_) => SketchImpl::Kmv,
            DaySketch::Set(_) => SketchImpl::Set,
            DaySketch::Theta(_) => SketchImpl::Theta,
        }
    }

    /// Record one key hash. Returns false when the backend cannot represent
    /// the key (a KMV sketch whose sampling threshold was frozen by an
    /// erasure diff); the caller then rebuilds the day from its audit log.
    pub fn insert(&mut self, h: u64) -> bool {
        match self {
            DaySketch::Kmv(s) => s.insert(h),
            DaySketch::Set(s) => {
                s.insert(h);
                true
            }
            DaySketch::Theta(s) => {
                s.insert(h);
                true
            }
        }
    }

    pub fn cardinality(&self) -> f64 {
        match self {
            DaySketch::Kmv(s) => s.cardinality(),
            DaySketch::Set(s) => s.cardinality(),
            DaySketch::Theta(s) => s.cardinality(),
        }
    }

    pub fn union(&self, other: &DaySketch) -> EngineResult<DaySketch> {
        match (self, other) {
            (DaySketch::Kmv(a), DaySketch::Kmv(b)) => Ok(DaySketch::Kmv(a.union(b))),
            (DaySketch::Set(a), DaySketch::Set(b)) => Ok(DaySketch::Set(a.union(b))),
            (DaySketch::Theta(a), DaySketch::Theta(b)) => Ok(DaySketch::Theta(a.union(b))),
            (a, b) => Err(EngineError::Fatal(format!(
                "cannot union {} sketch with {} sketch",
                a.kind().as_str(),
                b.kind().as_str()
            ))),
        }
    }

    pub fn diff(&self, removed: &RemovedFilter) -> DaySketch {
        match self {
            DaySketch::Kmv(s) => DaySketch::Kmv(s.diff(removed)),
            DaySketch::Set(s) => DaySketch::Set(s.diff(removed)),
            DaySketch::Theta(s) => DaySketch::Theta(s.diff(removed)),
        }
    }

    /// True when a Bloom-assisted diff may have over-deleted from this
    /// sketch or any sketch unioned into it.
    pub fn approximate_diffed(&self) -> bool {
        match self {
            DaySketch::Kmv(s) => s.approximate_diffed(),
            DaySketch::Set(s) => s.approximate_diffed(),
            DaySketch::Theta(s) => s.approximate_diffed(),
        }
    }

    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<DaySketch> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
