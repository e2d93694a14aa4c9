// dpau: Persistent ledger
//
// One embedded sled database holds every durable table behind a key prefix:
//
//   activity:{day}:{seq}        append-only audit log, rebuild source of truth
//   userday:{key}:{day}         per-user activity index for tombstone fan-out
//   erasure:{day}:{key}         erasure requests and their status
//   release:{metric}:{day}:{seq} release history
//   budget:{metric}:{month}     privacy budget entries
//   epoch:{id}                  salt epochs
//   sketch:{day}                serialized day-sketch cache (activity log is
//                               authoritative)
//
// All mutations belonging to one ingest or release are staged into a single
// batch and applied atomically, then flushed.

use crate::config::SketchImpl;
use crate::dp::Mechanism;
use crate::error::{EngineError, EngineResult};
use crate::hashing::SaltEpoch;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Released metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Dau,
    Mau,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Dau => "dau",
            Metric::Mau => "mau",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dau" => Ok(Metric::Dau),
            "mau" => Ok(Metric::Mau),
            other => Err(EngineError::Validation(format!(
                "unknown metric '{}', expected dau or mau",
                other
            ))),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turnstile operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "+")]
    Plus,
    #[serde(rename = "-")]
    Minus,
}

impl Op {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "+" => Ok(Op::Plus),
            "-" | "\u{2212}" => Ok(Op::Minus),
            other => Err(EngineError::Validation(format!(
                "unknown op '{}', expected + or -",
                other
            ))),
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub user_key: String,
    pub day: NaiveDate,
    pub op: Op,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErasureStatus {
    Pending,
    Done,
}

/// Erasure request for one (user, day); transitions pending -> done exactly
/// once when the day's rebuild completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErasureRecord {
    pub user_key: String,
    pub day: NaiveDate,
    pub status: ErasureStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub metric: Metric,
    pub day: NaiveDate,
    pub window_days: u32,
    pub epsilon: f64,
    pub delta: f64,
    pub mechanism: Mechanism,
    pub raw: f64,
    pub estimate: u64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub noise_seed: u64,
    pub sketch_impl: SketchImpl,
    pub diff_bias_bounded: bool,
    pub ts: DateTime<Utc>,
}

/// One (order, epsilon) point of an RDP curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RdpPoint {
    pub alpha: f64,
    pub epsilon: f64,
}

/// Per-(metric, month) budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub metric: Metric,
    pub month: String,
    pub naive_spent: f64,
    pub release_count: u64,
    /// Cumulative RDP totals per order.
    pub rdp_log: Vec<RdpPoint>,
    /// Per-release epsilon history, oldest first.
    pub epsilons: Vec<f64>,
}

impl BudgetEntry {
    pub fn empty(metric: Metric, month: &str, orders: &[f64]) -> Self {
        Self {
            metric,
            month: month.to_string(),
            naive_spent: 0.0,
            release_count: 0,
            rdp_log: orders
                .iter()
                .map(|a| RdpPoint {
                    alpha: *a,
                    epsilon: 0.0,
                })
                .collect(),
            epsilons: Vec::new(),
        }
    }
}

fn activity_key(day: NaiveDate, seq: u64) -> String {
    format!("activity:{}:{:020}", day, seq)
}

fn userday_key(user_hex: &str, day: NaiveDate) -> String {
    format!("userday:{}:{}", user_hex, day)
}

fn erasure_key(day: NaiveDate, user_hex: &str) -> String {
    format!("erasure:{}:{}", day, user_hex)
}

fn release_key(metric: Metric, day: NaiveDate, seq: u64) -> String {
    format!("release:{}:{}:{:020}", metric, day, seq)
}

fn budget_key(metric: Metric, month: &str) -> String {
    format!("budget:{}:{}", metric, month)
}

fn epoch_key(epoch_id: u32) -> String {
    format!("epoch:{:010}", epoch_id)
}

fn sketch_key(day: NaiveDate) -> String {
    format!("sketch:{}", day)
}

/// Staged mutations applied atomically by `Ledger::commit`.
#[derive(Default)]
pub struct WriteBatch {
    batch: Batch,
    staged: usize,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.staged == 0
    }

    fn insert_json<T: Serialize>(&mut self, key: String, value: &T) -> EngineResult<()> {
        self.batch.insert(key.as_bytes(), serde_json::to_vec(value)?);
        self.staged += 1;
        Ok(())
    }
}

pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn begin(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Apply all staged mutations atomically and make them durable.
    pub fn commit(&self, wb: WriteBatch) -> EngineResult<()> {
        self.db.apply_batch(wb.batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn next_seq(&self) -> EngineResult<u64> {
        Ok(self.db.generate_id()?)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> EngineResult<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    // --- staging -----------------------------------------------------------

    pub fn stage_activity(
        &self,
        wb: &mut WriteBatch,
        row: &ActivityRow,
        seq: u64,
    ) -> EngineResult<()> {
        wb.insert_json(activity_key(row.day, seq), row)
    }

    pub fn stage_userday(
        &self,
        wb: &mut WriteBatch,
        user_hex: &str,
        day: NaiveDate,
    ) -> EngineResult<()> {
        wb.batch.insert(userday_key(user_hex, day).as_bytes(), &b"1"[..]);
        wb.staged += 1;
        Ok(())
    }

    pub fn stage_erasure(&self, wb: &mut WriteBatch, rec: &ErasureRecord) -> EngineResult<()> {
        wb.insert_json(erasure_key(rec.day, &rec.user_key), rec)
    }

    pub fn stage_release(
        &self,
        wb: &mut WriteBatch,
        rec: &ReleaseRecord,
        seq: u64,
    ) -> EngineResult<()> {
        wb.insert_json(release_key(rec.metric, rec.day, seq), rec)
    }

    pub fn stage_budget(&self, wb: &mut WriteBatch, entry: &BudgetEntry) -> EngineResult<()> {
        wb.insert_json(budget_key(entry.metric, &entry.month), entry)
    }

    pub fn stage_epoch(&self, wb: &mut WriteBatch, epoch: &SaltEpoch) -> EngineResult<()> {
        wb.insert_json(epoch_key(epoch.epoch_id), epoch)
    }

    pub fn stage_sketch(
        &self,
        wb: &mut WriteBatch,
        day: NaiveDate,
        sketch_bytes: Vec<u8>,
    ) -> EngineResult<()> {
        wb.batch.insert(sketch_key(day).as_bytes(), sketch_bytes);
        wb.staged += 1;
        Ok(())
    }

    pub fn stage_sketch_removal(&self, wb: &mut WriteBatch, day: NaiveDate) {
        wb.batch.remove(sketch_key(day).as_bytes());
        wb.staged += 1;
    }

    pub fn delete_sketch(&self, day: NaiveDate) -> EngineResult<()> {
        self.db.remove(sketch_key(day).as_bytes())?;
        Ok(())
    }

    // --- reads -------------------------------------------------------------

    pub fn activity_for_day(&self, day: NaiveDate) -> EngineResult<Vec<ActivityRow>> {
        self.scan_json(&format!("activity:{}:", day))
    }

    /// Days on which a user key has recorded `+` activity.
    pub fn days_active(&self, user_hex: &str) -> EngineResult<Vec<NaiveDate>> {
        let prefix = format!("userday:{}:", user_hex);
        let mut days = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(raw) = key.strip_prefix(&prefix) {
                let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                    EngineError::Fatal(format!("malformed userday key '{}'", key))
                })?;
                days.push(day);
            }
        }
        Ok(days)
    }

    pub fn erasures_for_day(&self, day: NaiveDate) -> EngineResult<Vec<ErasureRecord>> {
        self.scan_json(&format!("erasure:{}:", day))
    }

    pub fn erasure(&self, day: NaiveDate, user_hex: &str) -> EngineResult<Option<ErasureRecord>> {
        self.get_json(&erasure_key(day, user_hex))
    }

    pub fn pending_erasures(&self) -> EngineResult<Vec<ErasureRecord>> {
        let all: Vec<ErasureRecord> = self.scan_json("erasure:")?;
        Ok(all
            .into_iter()
            .filter(|e| e.status == ErasureStatus::Pending)
            .collect())
    }

    pub fn budget(&self, metric: Metric, month: &str) -> EngineResult<Option<BudgetEntry>> {
        self.get_json(&budget_key(metric, month))
    }

    pub fn releases(&self, metric: Metric) -> EngineResult<Vec<ReleaseRecord>> {
        self.scan_json(&format!("release:{}:", metric))
    }

    pub fn epochs(&self) -> EngineResult<Vec<SaltEpoch>> {
        self.scan_json("epoch:")
    }

    pub fn sketch_blob(&self, day: NaiveDate) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.db.get(sketch_key(day).as_bytes())?.map(|v| v.to_vec()))
    }

    /// Export every key/value pair into a dated JSONL snapshot.
    pub fn backup_to(&self, dir: &Path, stamp: &str) -> EngineResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("ledger-{}.jsonl", stamp));
        let mut file = std::fs::File::create(&path)?;
        self.db.flush()?;
        for item in self.db.iter() {
            let (key, value) = item?;
            let value: serde_json::Value = serde_json::from_slice(&value)?;
            let line = serde_json::json!({
                "key": String::from_utf8_lossy(&key),
                "value": value,
            });
            writeln!(file, "{}", line)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, Ledger) {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(dir.path().join("ledger.sled")).unwrap();
        (dir, ledger)
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_activity_round_trip_in_day_order() {
        let (_dir, ledger) = ledger();
        let mut wb = ledger.begin();
        for (i, d) in ["2025-10-01", "2025-10-01", "2025-10-02"].iter().enumerate() {
            let row = ActivityRow {
                user_key: format!("{:064x}", i),
                day: day(d),
                op: Op::Plus,
                ts: Utc::now(),
            };
            ledger.stage_activity(&mut wb, &row, i as u64).unwrap();
        }
        ledger.commit(wb).unwrap();
        assert_eq!(ledger.activity_for_day(day("2025-10-01")).unwrap().len(), 2);
        assert_eq!(ledger.activity_for_day(day("2025-10-02")).unwrap().len(), 1);
        assert!(ledger.activity_for_day(day("2025-10-03")).unwrap().is_empty());
    }

    #[test]
    fn test_uncommitted_batch_leaves_no_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.sled");
        {
            let ledger = Ledger::open(&path).unwrap();
            let mut wb = ledger.begin();
            let row = ActivityRow {
                user_key: "ab".repeat(32),
                day: day("2025-10-01"),
                op: Op::Plus,
                ts: Utc::now(),
            };
            ledger.stage_activity(&mut wb, &row, 1).unwrap();
            // dropped without commit
        }
        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.activity_for_day(day("2025-10-01")).unwrap().is_empty());
    }

    #[test]
    fn test_erasure_status_round_trip() {
        let (_dir, ledger) = ledger();
        let user = "cd".repeat(32);
        let mut rec = ErasureRecord {
            user_key: user.clone(),
            day: day("2025-10-05"),
            status: ErasureStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut wb = ledger.begin();
        ledger.stage_erasure(&mut wb, &rec).unwrap();
        ledger.commit(wb).unwrap();
        assert_eq!(ledger.pending_erasures().unwrap().len(), 1);

        rec.status = ErasureStatus::Done;
        rec.completed_at = Some(Utc::now());
        let mut wb = ledger.begin();
        ledger.stage_erasure(&mut wb, &rec).unwrap();
        ledger.commit(wb).unwrap();
        assert!(ledger.pending_erasures().unwrap().is_empty());
        let stored = ledger.erasure(day("2025-10-05"), &user).unwrap().unwrap();
        assert_eq!(stored.status, ErasureStatus::Done);
    }

    #[test]
    fn test_userday_index() {
        let (_dir, ledger) = ledger();
        let user = "ef".repeat(32);
        let mut wb = ledger.begin();
        ledger.stage_userday(&mut wb, &user, day("2025-10-01")).unwrap();
        ledger.stage_userday(&mut wb, &user, day("2025-10-03")).unwrap();
        ledger.commit(wb).unwrap();
        let days = ledger.days_active(&user).unwrap();
        assert_eq!(days, vec![day("2025-10-01"), day("2025-10-03")]);
        assert!(ledger.days_active(&"00".repeat(32)).unwrap().is_empty());
    }

    #[test]
    fn test_budget_entry_round_trip() {
        let (_dir, ledger) = ledger();
        let entry = BudgetEntry::empty(Metric::Dau, "2025-10", &[2.0, 4.0]);
        let mut wb = ledger.begin();
        ledger.stage_budget(&mut wb, &entry).unwrap();
        ledger.commit(wb).unwrap();
        let stored = ledger.budget(Metric::Dau, "2025-10").unwrap().unwrap();
        assert_eq!(stored.release_count, 0);
        assert_eq!(stored.rdp_log.len(), 2);
        assert!(ledger.budget(Metric::Mau, "2025-10").unwrap().is_none());
    }

    #[test]
    fn test_backup_writes_jsonl(){
        let (dir, ledger) = ledger();
        let entry = BudgetEntry::empty(Metric::Dau, "2025-10", &[2.0]);
        let mut wb = ledger.begin();
        ledger.stage_budget(&mut wb, &entry).unwrap();
        ledger.commit(wb).unwrap();
        let path = ledger.backup_to(&dir.path().join("backups"), "20251001").unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("budget:dau:2025-10"));
    }
}
