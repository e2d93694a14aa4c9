// dpau: HMAC pseudonymization and salt epochs
//
// Identities are never stored raw. Each user id is mapped to a 32-byte
// HMAC-SHA256 digest keyed by the salt epoch covering the event day. The salt
// is deliberately NOT mixed with the day itself: a user must hash to the same
// key on every day of an epoch, otherwise a rolling window would count them
// once per active day.

use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Pseudonymized identity: HMAC-SHA256 digest of the user id under the epoch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserKey(pub [u8; 32]);

impl UserKey {
    /// 64-bit uniform hash used by the sketches.
    pub fn hash64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> EngineResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| EngineError::Validation(format!("invalid user key hex '{}'", s)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Validation("user key must be 32 bytes".to_string()))?;
        Ok(UserKey(arr))
    }
}

/// One salt epoch: the span of days over which the HMAC key is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaltEpoch {
    pub epoch_id: u32,
    /// Hex-encoded per-epoch secret, derived from the master secret.
    pub secret: String,
    pub effective_date: NaiveDate,
    pub rotation_days: u32,
}

impl SaltEpoch {
    pub fn secret_bytes(&self) -> EngineResult<Vec<u8>> {
        hex::decode(&self.secret)
            .map_err(|_| EngineError::Fatal(format!("epoch {} secret is not hex", self.epoch_id)))
    }
}

/// Derive the per-epoch secret from the master salt secret.
pub fn derive_epoch_secret(master: &[u8], epoch_id: u32) -> EngineResult<String> {
    let mut mac = HmacSha256::new_from_slice(master)
        .map_err(|e| EngineError::Fatal(format!("hmac key setup: {}", e)))?;
    mac.update(&epoch_id.to_be_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Ordered epoch schedule. The epoch covering a day is the latest one whose
/// effective date is on or before that day.
#[derive(Debug, Clone, Default)]
pub struct EpochSchedule {
    epochs: Vec<SaltEpoch>,
}

impl EpochSchedule {
    pub fn new(mut epochs: Vec<SaltEpoch>) -> Self {
        epochs.sort_by_key(|e| (e.effective_date, e.epoch_id));
        Self { epochs }
    }

    pub fn epoch_for(&self, day: NaiveDate) -> EngineResult<&SaltEpoch> {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.effective_date <= day)
            .ok_or_else(|| {
                EngineError::Validation(format!("no salt epoch covers day {}", day))
            })
    }

    pub fn latest(&self) -> Option<&SaltEpoch> {
        self.epochs.last()
    }

    pub fn push(&mut self, epoch: SaltEpoch) {
        self.epochs.push(epoch);
        self.epochs.sort_by_key(|e| (e.effective_date, e.epoch_id));
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// Derives pseudonymous user keys under the epoch schedule.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    schedule: EpochSchedule,
}

impl KeyDeriver {
    pub fn new(schedule: EpochSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &EpochSchedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut EpochSchedule {
        &mut self.schedule
    }

    /// `HMAC-SHA256(epoch_secret, epoch_id || user_id)` for the epoch
    /// covering `day`. Stable within an epoch, unlinkable across epochs.
    pub fn derive(&self, user_id: &str, day: NaiveDate) -> EngineResult<UserKey> {
        let epoch = self.schedule.epoch_for(day)?;
        let key = epoch.secret_bytes()?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| EngineError::Fatal(format!("hmac key setup: {}", e)))?;
        mac.update(&epoch.epoch_id.to_be_bytes());
        mac.update(user_id.as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(UserKey(out))
    }
}
