//! Retry policy for pipeline calls.
//!
//! Exponential backoff with optional jitter. The policy is owned by the
//! scheduler; the pipeline client itself never retries.

use std::time::Duration;

use evalgate_ledger::ErrorKind;
use serde::{Deserialize, Serialize};

/// Retry configuration shared by every worker of a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total calls per question, first call included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 25% on top of the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single call, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed): `min(base * 2^retry, max)`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32);
        let base = self.base_delay.as_millis() as f64 * factor;
        let clamped = base.min(self.max_delay.as_millis() as f64);

        let total = if self.jitter {
            clamped + clamped * 0.25 * rand_jitter()
        } else {
            clamped
        };
        Duration::from_millis(total as u64)
    }

    /// Whether a failure on call number `attempt` (1-based) earns another call.
    pub fn should_retry(&self, error_kind: ErrorKind, attempt: u32) -> bool {
        error_kind.is_transient() && attempt < self.max_attempts.max(1)
    }
}

/// Pseudo-random value in `[0, 1)` from a time-seeded LCG.
fn rand_jitter() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0);

    const A: u64 = 1103515245;
    const C: u64 = 12345;
    const M: u64 = 1 << 31;

    let seed = SEED.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let next = (A.wrapping_mul(seed.wrapping_add(nanos)).wrapping_add(C)) % M;
    next as f64 / M as f64
}
