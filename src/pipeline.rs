// dpau: Ingestion, erasure replay and release pipeline
//
// The pipeline owns the window store, the ledger and the noise source, and
// serializes every top-level operation behind one writer lock: a release for
// day D reflects every ingest and erasure committed before it and none after.
// Read-only snapshots (budget, health) take the shared side of the lock.

use crate::accountant::{month_of, next_month, Accountant, BudgetSnapshot};
use crate::config::{AppConfig, SketchImpl};
use crate::dp::{
    ci_half_width, gaussian_sigma, laplace_scale, noisy_count, Mechanism, NoiseSampler,
};
use crate::error::{is_retryable_error, EngineError, EngineResult};
use crate::hashing::{derive_epoch_secret, EpochSchedule, KeyDeriver, SaltEpoch};
use crate::ledger::{
    ActivityRow, ErasureRecord, ErasureStatus, Ledger, Metric, Op, ReleaseRecord,
};
use crate::sketch::DaySketch;
use crate::window::WindowStore;
use chrono::{Days, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// Inbound turnstile event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub op: Op,
    pub day: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of a successful DP release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutput {
    pub metric: Metric,
    pub day: NaiveDate,
    pub window_days: u32,
    pub estimate: u64,
    pub raw: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub epsilon: f64,
    pub delta: f64,
    pub mechanism: Mechanism,
    pub sketch_impl: SketchImpl,
    pub diff_bias_bounded: bool,
    pub budget: BudgetSnapshot,
}

struct PipelineInner {
    ledger: Ledger,
    windows: WindowStore,
    deriver: KeyDeriver,
    sampler: NoiseSampler,
}

pub struct Pipeline {
    config: AppConfig,
    accountant: Accountant,
    inner: RwLock<PipelineInner>,
}

impl Pipeline {
    pub fn open(config: AppConfig) -> EngineResult<Self> {
        config.validate()?;
        let ledger = Ledger::open(config.ledger_path())?;
        let mut epochs = ledger.epochs()?;
        if epochs.is_empty() {
            // Bootstrap epoch 0 from the master secret; it covers all history
            // until the first rotation.
            let epoch = SaltEpoch {
                epoch_id: 0,
                secret: derive_epoch_secret(&config.hash_salt_secret, 0)?,
                effective_date: NaiveDate::default(),
                rotation_days: config.hash_salt_rotation_days,
            };
            let mut wb = ledger.begin();
            ledger.stage_epoch(&mut wb, &epoch)?;
            ledger.commit(wb)?;
            epochs.push(epoch);
        }
        let deriver = KeyDeriver::new(EpochSchedule::new(epochs));
        let windows = WindowStore::new(&config);
        let sampler = NoiseSampler::new(config.default_seed);
        let accountant = Accountant::new(&config);
        info!(
            data_dir = %config.data_dir.display(),
            sketch = config.sketch_impl.as_str(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            accountant,
            inner: RwLock::new(PipelineInner {
                ledger,
                windows,
                deriver,
                sampler,
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Commit a batch of events. The whole batch is validated first and
    /// written in one transaction; a bad event rejects the batch with no
    /// partial ingest. A `-` event enqueues an erasure for its day and fans
    /// tombstones out to every prior day the key was active.
    pub fn ingest(&self, events: &[Event]) -> EngineResult<usize> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let now = Utc::now();
        let today = now.date_naive();

        for event in events {
            if event.user_id.is_empty() {
                return Err(EngineError::Validation(
                    "user_id must not be empty".to_string(),
                ));
            }
            if event.day > today {
                return Err(EngineError::Validation(format!(
                    "event day {} is in the future",
                    event.day
                )));
            }
        }

        let mut wb = inner.ledger.begin();
        let mut scratch: BTreeMap<NaiveDate, DaySketch> = BTreeMap::new();
        let mut dirty: BTreeSet<NaiveDate> = BTreeSet::new();
        // Days whose cached sketch could not absorb a new key (frozen sample
        // space after an erasure diff); their cache is dropped and the next
        // rebuild replays the audit log.
        let mut replay_days: BTreeSet<NaiveDate> = BTreeSet::new();

        for event in events {
            let key = inner.deriver.derive(&event.user_id, event.day)?;
            let user_hex = key.to_hex();
            let seq = inner.ledger.next_seq()?;
            inner.ledger.stage_activity(
                &mut wb,
                &ActivityRow {
                    user_key: user_hex.clone(),
                    day: event.day,
                    op: event.op,
                    ts: now,
                },
                seq,
            )?;
            match event.op {
                Op::Plus => {
                    inner.ledger.stage_userday(&mut wb, &user_hex, event.day)?;
                    if !scratch.contains_key(&event.day) {
                        let current = inner.windows.current(&inner.ledger, event.day)?;
                        scratch.insert(event.day, current);
                    }
                    if let Some(sketch) = scratch.get_mut(&event.day) {
                        if !sketch.insert(key.hash64()) {
                            replay_days.insert(event.day);
                        }
                    }
                }
                Op::Minus => {
                    let mut days: BTreeSet<NaiveDate> = inner
                        .ledger
                        .days_active(&user_hex)?
                        .into_iter()
                        .filter(|d| *d <= event.day)
                        .collect();
                    days.insert(event.day);
                    for day in days {
                        if inner.ledger.erasure(day, &user_hex)?.is_none() {
                            inner.ledger.stage_erasure(
                                &mut wb,
                                &ErasureRecord {
                                    user_key: user_hex.clone(),
                                    day,
                                    status: ErasureStatus::Pending,
                                    created_at: now,
                                    completed_at: None,
                                },
                            )?;
                            if day != event.day {
                                // tombstone audit row on the prior active day
                                let seq = inner.ledger.next_seq()?;
                                inner.ledger.stage_activity(
                                    &mut wb,
                                    &ActivityRow {
                                        user_key: user_hex.clone(),
                                        day,
                                        op: Op::Minus,
                                        ts: now,
                                    },
                                    seq,
                                )?;
                            }
                        }
                        dirty.insert(day);
                    }
                }
            }
        }

        for (day, sketch) in &scratch {
            if replay_days.contains(day) {
                inner.ledger.stage_sketch_removal(&mut wb, *day);
            } else {
                inner.ledger.stage_sketch(&mut wb, *day, sketch.to_bytes()?)?;
            }
        }
        inner.ledger.commit(wb)?;

        // The commit is durable; only now does in-memory state move.
        for (day, sketch) in scratch {
            if replay_days.contains(&day) {
                inner.windows.evict(day);
                inner.windows.mark_dirty(day);
            } else {
                inner.windows.install(day, sketch);
            }
        }
        for day in dirty {
            inner.windows.mark_dirty(day);
        }
        info!(events = events.len(), "batch ingested");
        Ok(events.len())
    }

    /// Replay every pending erasure: rebuild the affected days, persist the
    /// rebuilt sketches and flip the requests to done in one transaction.
    pub fn replay_deletions(&self) -> EngineResult<usize> {
        let mut guard = self.inner.write();
        Self::replay_locked(&mut guard)
    }

    fn replay_locked(inner: &mut PipelineInner) -> EngineResult<usize> {
        let pending = inner.ledger.pending_erasures()?;
        if pending.is_empty() {
            return Ok(0);
        }
        let days: BTreeSet<NaiveDate> = pending.iter().map(|e| e.day).collect();
        for day in &days {
            inner.windows.mark_dirty(*day);
            inner.windows.rebuild(&inner.ledger, *day)?;
        }

        let now = Utc::now();
        let rebuilt = inner.windows.rebuilt_days();
        let mut wb = inner.ledger.begin();
        for day in &rebuilt {
            if let Some(bytes) = inner.windows.sketch_bytes(*day)? {
                inner.ledger.stage_sketch(&mut wb, *day, bytes)?;
            }
        }
        let completed = pending.len();
        for mut rec in pending {
            rec.status = ErasureStatus::Done;
            rec.completed_at = Some(now);
            inner.ledger.stage_erasure(&mut wb, &rec)?;
        }
        inner.ledger.commit(wb)?;
        inner.windows.clear_rebuilt();
        info!(count = completed, "erasures replayed");
        Ok(completed)
    }

    pub fn release_dau(&self, day: NaiveDate) -> EngineResult<ReleaseOutput> {
        self.release_with_retry(Metric::Dau, day, 1)
    }

    pub fn release_mau(&self, end: NaiveDate, window: Option<u32>) -> EngineResult<ReleaseOutput> {
        let w = window.unwrap_or(self.config.mau_window_days);
        if w == 0 || w > self.config.hash_salt_rotation_days {
            return Err(EngineError::Validation(format!(
                "window {} outside supported range 1..={}",
                w, self.config.hash_salt_rotation_days
            )));
        }
        self.release_with_retry(Metric::Mau, end, w)
    }

    // Budget rejections are never retried; transient ledger failures get one
    // internal retry before surfacing.
    fn release_with_retry(
        &self,
        metric: Metric,
        end: NaiveDate,
        w: u32,
    ) -> EngineResult<ReleaseOutput> {
        match self.release_once(metric, end, w) {
            Err(e) if is_retryable_error(&e) => {
                warn!(metric = metric.as_str(), error = %e, "transient release failure, retrying once");
                self.release_once(metric, end, w)
            }
            other => other,
        }
    }

    fn release_once(&self, metric: Metric, end: NaiveDate, w: u32) -> EngineResult<ReleaseOutput> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        Self::replay_locked(inner)?;

        let union = inner.windows.rolling_union(&inner.ledger, end, w)?;
        let raw = union.cardinality();
        let diff_bias_bounded = union.approximate_diffed();

        let month = month_of(end);
        let epsilon = match metric {
            Metric::Dau => self.config.epsilon_dau,
            Metric::Mau => self.config.epsilon_mau,
        };
        let delta = match metric {
            Metric::Dau => 0.0,
            Metric::Mau => self.config.delta,
        };
        let mut entry = self.accountant.admit(&inner.ledger, metric, &month, epsilon)?;

        let sensitivity = f64::from(self.config.w_bound);
        let (mechanism, scale) = match metric {
            Metric::Dau => (Mechanism::Laplace, laplace_scale(sensitivity, epsilon)),
            Metric::Mau => (
                Mechanism::Gaussian,
                gaussian_sigma(sensitivity, epsilon, self.config.delta),
            ),
        };
        let noise_seed = inner.sampler.release_seed();
        let noise = inner.sampler.sample(mechanism, scale)?;
        let estimate = noisy_count(raw, noise);
        let half = ci_half_width(mechanism, scale);

        let contribution =
            self.accountant
                .rdp_contribution(mechanism, epsilon, self.config.delta, sensitivity);
        self.accountant.charge(&mut entry, epsilon, &contribution);

        let record = ReleaseRecord {
            metric,
            day: end,
            window_days: w,
            epsilon,
            delta,
            mechanism,
            raw,
            estimate,
            ci_low: estimate as f64 - half,
            ci_high: estimate as f64 + half,
            noise_seed,
            sketch_impl: self.config.sketch_impl,
            diff_bias_bounded,
            ts: Utc::now(),
        };

        let rebuilt = inner.windows.rebuilt_days();
        let mut wb = inner.ledger.begin();
        for day in &rebuilt {
            if let Some(bytes) = inner.windows.sketch_bytes(*day)? {
                inner.ledger.stage_sketch(&mut wb, *day, bytes)?;
            }
        }
        let seq = inner.ledger.next_seq()?;
        inner.ledger.stage_release(&mut wb, &record, seq)?;
        inner.ledger.stage_budget(&mut wb, &entry)?;
        inner.ledger.commit(wb)?;
        inner.windows.clear_rebuilt();

        info!(
            metric = metric.as_str(),
            day = %end,
            window = w,
            estimate,
            "release recorded"
        );

        Ok(ReleaseOutput {
            metric,
            day: end,
            window_days: w,
            estimate,
            raw,
            ci_low: record.ci_low,
            ci_high: record.ci_high,
            epsilon,
            delta,
            mechanism,
            sketch_impl: self.config.sketch_impl,
            diff_bias_bounded,
            budget: self.accountant.snapshot_of(&entry),
        })
    }

    /// Budget view for the month containing `day`; side-effect free.
    pub fn budget_snapshot(&self, metric: Metric, day: NaiveDate) -> EngineResult<BudgetSnapshot> {
        let guard = self.inner.read();
        self.accountant.snapshot(&guard.ledger, metric, &month_of(day))
    }

    /// Zero a month's budget entry. Idempotent; intended for operators.
    pub fn reset_budget(&self, metric: Metric, month: &str) -> EngineResult<()> {
        next_month(month)?; // validates the format
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let entry = self.accountant.reset_entry(metric, month);
        let mut wb = inner.ledger.begin();
        inner.ledger.stage_budget(&mut wb, &entry)?;
        inner.ledger.commit(wb)?;
        info!(metric = metric.as_str(), month, "budget reset");
        Ok(())
    }

    /// Append a salt epoch taking effect strictly after the live window. A
    /// rotation that would re-key days already covered by the current MAU
    /// window is a conflict and leaves state untouched.
    pub fn rotate_salt(
        &self,
        effective: NaiveDate,
        rotation_days: Option<u32>,
    ) -> EngineResult<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let rotation_days = rotation_days.unwrap_or(self.config.hash_salt_rotation_days);
        if rotation_days < self.config.mau_window_days {
            return Err(EngineError::Validation(format!(
                "rotation period {} days is shorter than the {}-day MAU window",
                rotation_days, self.config.mau_window_days
            )));
        }
        let today = Utc::now().date_naive();
        if effective <= today {
            return Err(EngineError::Conflict(format!(
                "salt rotation effective {} lands inside the active {}-day window ending {}",
                effective, self.config.mau_window_days, today
            )));
        }
        // Epochs must be at least one full rotation period apart, otherwise a
        // later rolling window straddles the boundary and re-keys the same
        // user under two secrets.
        if let Some(latest) = inner.deriver.schedule().latest() {
            let earliest = latest
                .effective_date
                .checked_add_days(Days::new(u64::from(latest.rotation_days)))
                .ok_or_else(|| EngineError::Fatal("calendar overflow".to_string()))?;
            if effective < earliest {
                return Err(EngineError::Conflict(format!(
                    "salt rotation effective {} is less than {} days after epoch {} (effective {})",
                    effective, latest.rotation_days, latest.epoch_id, latest.effective_date
                )));
            }
        }
        let epoch_id = inner
            .deriver
            .schedule()
            .latest()
            .map(|e| e.epoch_id + 1)
            .unwrap_or(0);
        let epoch = SaltEpoch {
            epoch_id,
            secret: derive_epoch_secret(&self.config.hash_salt_secret, epoch_id)?,
            effective_date: effective,
            rotation_days,
        };
        let mut wb = inner.ledger.begin();
        inner.ledger.stage_epoch(&mut wb, &epoch)?;
        inner.ledger.commit(wb)?;
        inner.deriver.schedule_mut().push(epoch);
        info!(epoch_id, effective = %effective, "salt epoch appended");
        Ok(())
    }

    /// Liveness under the shared lock.
    pub fn healthy(&self) -> bool {
        let _guard = self.inner.read();
        true
    }

    /// Write the current month's budget snapshots to the reports directory.
    pub fn write_budget_report(&self) -> EngineResult<PathBuf> {
        let guard = self.inner.read();
        let month = month_of(Utc::now().date_naive());
        let dau = self.accountant.snapshot(&guard.ledger, Metric::Dau, &month)?;
        let mau = self.accountant.snapshot(&guard.ledger, Metric::Mau, &month)?;
        let dir = self.config.reports_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("budget-snapshot.json");
        let body = serde_json::json!({
            "generated_at": Utc::now(),
            "month": month,
            "dau": dau,
            "mau": mau,
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&body)?)?;
        Ok(path)
    }

    /// Snapshot the ledger into the backups directory.
    pub fn backup(&self) -> EngineResult<PathBuf> {
        let guard = self.inner.read();
        let stamp = Utc::now().format("%Y%m%d").to_string();
        guard.ledger.backup_to(&self.config.backups_dir(), &stamp)
    }

    // Audit visibility, used by operators and tests.

    pub fn activity_rows(&self, day: NaiveDate) -> EngineResult<Vec<ActivityRow>> {
        let guard = self.inner.read();
        guard.ledger.activity_for_day(day)
    }

    pub fn pending_erasure_count(&self) -> EngineResult<usize> {
        let guard = self.inner.read();
        Ok(guard.ledger.pending_erasures()?.len())
    }

    pub fn epoch_count(&self) -> usize {
        let guard = self.inner.read();
        guard.deriver.schedule().len()
    }
}
