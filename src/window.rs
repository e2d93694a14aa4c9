// dpau: Per-day sketch store and rolling windows
//
// Maps each calendar day to its distinct-count sketch. Erasures mark days
// dirty; dirty days are rebuilt before any union that covers them. The
// serialized blobs in the ledger are a cache, the activity log is the
// authoritative rebuild source.

use crate::config::{AppConfig, SketchImpl};
use crate::error::{EngineError, EngineResult};
use crate::hashing::UserKey;
use crate::ledger::{Ledger, Op};
use crate::sketch::{DaySketch, RemovedFilter};
use chrono::{Days, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};

pub struct WindowStore {
    sketch_impl: SketchImpl,
    sketch_k: usize,
    use_bloom_for_diff: bool,
    bloom_fp_rate: f64,
    sketches: BTreeMap<NaiveDate, DaySketch>,
    dirty: BTreeSet<NaiveDate>,
    // Days rebuilt since the last drain; their blobs need persisting.
    rebuilt: BTreeSet<NaiveDate>,
}

impl WindowStore {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            sketch_impl: cfg.sketch_impl,
            sketch_k: cfg.sketch_k,
            use_bloom_for_diff: cfg.use_bloom_for_diff,
            bloom_fp_rate: cfg.bloom_fp_rate,
            sketches: BTreeMap::new(),
            dirty: BTreeSet::new(),
            rebuilt: BTreeSet::new(),
        }
    }

    pub fn fresh(&self) -> DaySketch {
        DaySketch::new(self.sketch_impl, self.sketch_k)
    }

    fn ensure_loaded(&mut self, ledger: &Ledger, day: NaiveDate) -> EngineResult<bool> {
        if self.sketches.contains_key(&day) {
            return Ok(true);
        }
        if let Some(blob) = ledger.sketch_blob(day)? {
            self.sketches.insert(day, DaySketch::from_bytes(&blob)?);
            return Ok(true);
        }
        Ok(false)
    }

    /// A copy of the day's current sketch (rehydrated from its blob when not
    /// in memory), or a fresh one for an untouched day.
    pub fn current(&mut self, ledger: &Ledger, day: NaiveDate) -> EngineResult<DaySketch> {
        if self.ensure_loaded(ledger, day)? {
            if let Some(sk) = self.sketches.get(&day) {
                return Ok(sk.clone());
            }
        }
        Ok(self.fresh())
    }

    pub fn install(&mut self, day: NaiveDate, sketch: DaySketch) {
        self.sketches.insert(day, sketch);
    }

    /// Record a user key as active on a day.
    pub fn touch(&mut self, ledger: &Ledger, day: NaiveDate, key_hash: u64) -> EngineResult<()> {
        let mut sketch = self.current(ledger, day)?;
        if sketch.insert(key_hash) {
            self.install(day, sketch);
        } else {
            // The frozen sample space cannot absorb the key; drop the cached
            // state so the next rebuild replays the audit log instead.
            self.evict(day);
            ledger.delete_sketch(day)?;
            self.mark_dirty(day);
        }
        Ok(())
    }

    /// Drop a day's cached sketch from memory.
    pub fn evict(&mut self, day: NaiveDate) {
        self.sketches.remove(&day);
    }

    /// Schedule removal of erased keys from a day at its next rebuild.
    pub fn mark_dirty(&mut self, day: NaiveDate) {
        self.dirty.insert(day);
    }

    pub fn is_dirty(&self, day: NaiveDate) -> bool {
        self.dirty.contains(&day)
    }

    pub fn dirty_days(&self) -> Vec<NaiveDate> {
        self.dirty.iter().copied().collect()
    }

    /// Days rebuilt since the last `clear_rebuilt`; the caller persists
    /// their blobs and clears the set once the write is durable.
    pub fn rebuilt_days(&self) -> Vec<NaiveDate> {
        self.rebuilt.iter().copied().collect()
    }

    pub fn clear_rebuilt(&mut self) {
        self.rebuilt.clear();
    }

    pub fn sketch_bytes(&self, day: NaiveDate) -> EngineResult<Option<Vec<u8>>> {
        match self.sketches.get(&day) {
            Some(sk) => Ok(Some(sk.to_bytes()?)),
            None => Ok(None),
        }
    }

    fn removed_filter(&self, ledger: &Ledger, day: NaiveDate) -> EngineResult<RemovedFilter> {
        let mut removed = Vec::new();
        for rec in ledger.erasures_for_day(day)? {
            removed.push(UserKey::from_hex(&rec.user_key)?.hash64());
        }
        Ok(RemovedFilter::build(
            &removed,
            self.use_bloom_for_diff,
            self.bloom_fp_rate,
        ))
    }

    /// Reconstruct a dirty day's sketch with every erased key excluded.
    /// Returns true when the day was actually rebuilt.
    pub fn rebuild(&mut self, ledger: &Ledger, day: NaiveDate) -> EngineResult<bool> {
        if !self.dirty.contains(&day) {
            if self.ensure_loaded(ledger, day)? {
                return Ok(false);
            }
            // No cached sketch anywhere. A day whose cache was dropped after
            // an unabsorbable insert (or lost with the process) comes back
            // from the audit log.
            let filter = self.removed_filter(ledger, day)?;
            let rebuilt = self.replay(ledger, day, &filter)?;
            if rebuilt.cardinality() == 0.0 {
                return Ok(false);
            }
            self.sketches.insert(day, rebuilt);
            self.rebuilt.insert(day);
            return Ok(true);
        }
        let filter = self.removed_filter(ledger, day)?;
        let rebuilt = if self.ensure_loaded(ledger, day)? {
            // The live sketch already reflects every recorded insertion, so
            // the erasure diff is enough.
            match self.sketches.get(&day) {
                Some(current) => current.diff(&filter),
                None => self.replay(ledger, day, &filter)?,
            }
        } else {
            self.replay(ledger, day, &filter)?
        };
        self.sketches.insert(day, rebuilt);
        self.dirty.remove(&day);
        self.rebuilt.insert(day);
        Ok(true)
    }

    // Cold path: replay the day's audit rows through the removed filter.
    fn replay(
        &self,
        ledger: &Ledger,
        day: NaiveDate,
        filter: &RemovedFilter,
    ) -> EngineResult<DaySketch> {
        let mut sketch = self.fresh();
        for row in ledger.activity_for_day(day)? {
            if row.op == Op::Plus {
                let h = UserKey::from_hex(&row.user_key)?.hash64();
                if !filter.contains(h) {
                    sketch.insert(h);
                }
            }
        }
        Ok(sketch)
    }

    /// Union of the day sketches in `[end - w + 1, end]`, rebuilding dirty
    /// days first. The result is a fresh sketch, never shared with the store.
    pub fn rolling_union(
        &mut self,
        ledger: &Ledger,
        end: NaiveDate,
        w: u32,
    ) -> EngineResult<DaySketch> {
        if w == 0 {
            return Err(EngineError::Validation("window must be positive".to_string()));
        }
        let start = end
            .checked_sub_days(Days::new(u64::from(w) - 1))
            .ok_or_else(|| EngineError::Validation(format!("window {} underflows calendar", w)))?;
        let mut acc = self.fresh();
        let mut day = start;
        loop {
            self.rebuild(ledger, day)?;
            if let Some(sk) = self.sketches.get(&day) {
                acc = acc.union(sk)?;
            }
            if day == end {
                break;
            }
            day = day
                .succ_opt()
                .ok_or_else(|| EngineError::Fatal("calendar overflow".to_string()))?;
        }
        Ok(acc)
    }
}
