use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff with random jitter for failed batch writes.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_retries: u32,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        BackoffPolicy {
            base: config.base(),
            max: config.max(),
            max_retries: config.max_retries,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a batch that failed on `attempt` (0 for the first write) gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// `min(base * 2^attempt, max)`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }

    /// [`capped_delay`](Self::capped_delay) moved up or down by at most `jitter` of itself.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter == 0.0 {
            return capped;
        }

        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((capped.as_secs_f64() * (1.0 + factor)).max(0.0))
    }
}

/// Delay applied by every flush slot of one partition before its next write.
///
/// Raised on retryable failures and halved on every success, so a recovered partition drains
/// back to full speed within a few batches.
#[derive(Debug, Default)]
pub struct PartitionBackoff {
    delay_ms: AtomicU64,
}

impl PartitionBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn is_active(&self) -> bool {
        self.delay_ms.load(Ordering::Relaxed) > 0
    }

    pub fn set(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Halve the delay, returning the new value.
    pub fn halve(&self) -> Duration {
        let previous = self
            .delay_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |ms| Some(ms / 2))
            .unwrap_or_default();
        Duration::from_millis(previous / 2)
    }
}
