// dpau: Synthetic turnstile stream generation

use crate::error::EngineResult;
use crate::ledger::Op;
use crate::pipeline::Event;
use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub users: usize,
    pub days: u32,
    pub start: NaiveDate,
    /// Per-user daily activity probability.
    pub activity_rate: f64,
    /// Fraction of users who request erasure on their last active day.
    pub deletion_rate: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            users: 100,
            days: 30,
            start: NaiveDate::default(),
            activity_rate: 0.4,
            deletion_rate: 0.05,
        }
    }
}

/// Generate a reproducible synthetic event stream.
pub fn generate(cfg: &SynthConfig, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut events = Vec::new();
    for user in 0..cfg.users {
        let user_id = format!("user-{:06}", user);
        let mut last_active: Option<NaiveDate> = None;
        for offset in 0..cfg.days {
            if rng.gen::<f64>() < cfg.activity_rate {
                if let Some(day) = cfg.start.checked_add_days(Days::new(u64::from(offset))) {
                    events.push(Event {
                        user_id: user_id.clone(),
                        op: Op::Plus,
                        day,
                        metadata: None,
                    });
                    last_active = Some(day);
                }
            }
        }
        if let Some(day) = last_active {
            if rng.gen::<f64>() < cfg.deletion_rate {
                events.push(Event {
                    user_id,
                    op: Op::Minus,
                    day,
                    metadata: None,
                });
            }
        }
    }
    events
}

/// Write events as JSONL into the streams directory.
pub fn write_jsonl(events: &[Event], dir: &Path, name: &str) -> EngineResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.jsonl", name));
    let mut file = std::fs::File::create(&path)?;
    for event in events {
        writeln!(file, "{}", serde_json::to_string(event)?)?;
    }
    Ok(path)
}
