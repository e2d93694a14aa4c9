// dpau: Sliding-window rate limiter
//
// Process-local admission control at the ingest boundary. State is not
// persisted; a restart resets the window.

use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct SlidingWindowLimiter {
    max_per_window: u32,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn per_minute(max_per_minute: u32) -> Self {
        Self::new(max_per_minute, Duration::from_secs(60))
    }

    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    /// Admit one request or fail with the retry-after hint.
    pub fn try_acquire(&self) -> EngineResult<()> {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max_per_window as usize {
            let retry_after_secs = hits
                .front()
                .map(|front| {
                    let elapsed = now.duration_since(*front);
                    self.window.saturating_sub(elapsed).as_secs().max(1)
                })
                .unwrap_or(1);
            return Err(EngineError::RateLimited { retry_after_secs });
        }
        hits.push_back(now);
        Ok(())
    }
}
