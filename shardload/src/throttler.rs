use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{AdaptiveDegradationConfig, ThrottlingConfig};
use crate::degradation::{CircuitState, DegradationEvent, PartitionDegradationState};
use crate::stats::ImportMetrics;
use crate::token_bucket::TokenBucket;

struct PartitionThrottle {
    state: Mutex<PartitionDegradationState>,
    bucket: Mutex<Arc<TokenBucket>>,
}

impl PartitionThrottle {
    fn new(limit: u32) -> Self {
        PartitionThrottle {
            state: Mutex::new(PartitionDegradationState::new()),
            bucket: Mutex::new(Arc::new(TokenBucket::with_default_burst(limit))),
        }
    }

    fn bucket(&self) -> Arc<TokenBucket> {
        self.bucket.lock().clone()
    }

    fn resize(&self, limit: u32) {
        let mut bucket = self.bucket.lock();
        if bucket.rate_per_second() != limit {
            *bucket = Arc::new(TokenBucket::with_default_burst(limit));
        }
    }
}

/// Two-tier rate limiter: one bucket for the whole account and one per partition, the latter
/// sized to the partition's current effective limit.
///
/// Write failures reported through [`record_error`](Self::record_error) shrink a partition's limit
/// and eventually open its circuit; successes slowly bring it back. Nothing here retries, that is
/// up to the caller.
pub struct HierarchicalThrottler {
    global: TokenBucket,
    partition_limit: u32,
    degradation: AdaptiveDegradationConfig,
    partitions: DashMap<String, Arc<PartitionThrottle>>,
    metrics: Arc<ImportMetrics>,
}

impl HierarchicalThrottler {
    pub fn new(
        throttling: &ThrottlingConfig,
        degradation: AdaptiveDegradationConfig,
        metrics: Arc<ImportMetrics>,
    ) -> Self {
        HierarchicalThrottler {
            global: TokenBucket::with_default_burst(throttling.global_limit_per_second),
            partition_limit: throttling.partition_limit_per_second.max(1),
            degradation,
            partitions: DashMap::new(),
            metrics,
        }
    }

    pub fn partition_limit(&self) -> u32 {
        self.partition_limit
    }

    fn partition(&self, partition_key: &str) -> Arc<PartitionThrottle> {
        if let Some(throttle) = self.partitions.get(partition_key) {
            return throttle.clone();
        }
        self.partitions
            .entry(partition_key.to_string())
            .or_insert_with(|| Arc::new(PartitionThrottle::new(self.partition_limit)))
            .clone()
    }

    /// Wait for `count` tokens from both the global and the partition bucket.
    ///
    /// Returns how long the caller was held back. Dropping the future before it completes can
    /// leave tokens taken from one bucket but not the other, which only delays later callers.
    pub async fn acquire(&self, partition_key: &str, count: u32) -> Duration {
        let bucket = self.partition(partition_key).bucket();
        let started = Instant::now();

        tokio::join!(self.global.consume(count), bucket.consume(count));

        let waited = started.elapsed();
        if !waited.is_zero() {
            self.metrics.record_throttle_wait(partition_key, waited);
        }
        waited
    }

    /// Run `callback` once `count` tokens were granted for `partition_key`.
    pub async fn execute<F, Fut, T>(&self, partition_key: &str, count: u32, callback: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(partition_key, count).await;
        callback().await
    }

    /// Limit currently applied to the partition, never below 1.
    pub fn effective_partition_limit(&self, partition_key: &str) -> u32 {
        if !self.degradation.enabled {
            return self.partition_limit;
        }

        match self.partitions.get(partition_key) {
            Some(throttle) => throttle
                .state
                .lock()
                .effective_limit(self.partition_limit)
                .max(1),
            None => self.partition_limit,
        }
    }

    pub fn circuit_state(&self, partition_key: &str) -> CircuitState {
        if !self.degradation.enabled {
            return CircuitState::Closed;
        }

        self.partitions
            .get(partition_key)
            .map(|throttle| throttle.state.lock().circuit_state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Re-check an open circuit, half-opening it once the reset interval elapsed.
    pub fn poll_circuit(&self, partition_key: &str) -> CircuitState {
        if !self.degradation.enabled {
            return CircuitState::Closed;
        }
        let Some(throttle) = self.partitions.get(partition_key).map(|t| t.clone()) else {
            return CircuitState::Closed;
        };

        let (event, state) = {
            let mut state = throttle.state.lock();
            let event = state.try_half_open(self.partition_limit, &self.degradation, Instant::now());
            (event, state.circuit_state())
        };
        self.apply(partition_key, &throttle, event, None);

        state
    }

    pub fn record_error(&self, partition_key: &str, error: &dyn Display) -> DegradationEvent {
        if !self.degradation.enabled {
            return DegradationEvent::Ignored;
        }

        let throttle = self.partition(partition_key);
        let event = throttle.state.lock().record_error(
            self.partition_limit,
            &self.degradation,
            Instant::now(),
        );
        self.apply(partition_key, &throttle, event, Some(error));

        event
    }

    pub fn record_success(&self, partition_key: &str) -> DegradationEvent {
        if !self.degradation.enabled {
            return DegradationEvent::Ignored;
        }
        let Some(throttle) = self.partitions.get(partition_key).map(|t| t.clone()) else {
            return DegradationEvent::Unchanged;
        };

        let event = throttle.state.lock().record_success(
            self.partition_limit,
            &self.degradation,
            Instant::now(),
        );
        self.apply(partition_key, &throttle, event, None);

        event
    }

    fn apply(
        &self,
        partition_key: &str,
        throttle: &PartitionThrottle,
        event: DegradationEvent,
        cause: Option<&dyn Display>,
    ) {
        let cause = cause.map(|c| c.to_string()).unwrap_or_default();
        let reset_secs = self.degradation.circuit_breaker_reset_interval_secs;

        match event {
            DegradationEvent::Ignored | DegradationEvent::Unchanged => return,
            DegradationEvent::Degraded { from, to } => {
                warn!(partition = partition_key, from, to, error = %cause, "partition limit degraded");
                self.metrics.record_degradation();
            }
            DegradationEvent::Opened { from, to } => {
                if from != to {
                    warn!(partition = partition_key, from, to, error = %cause, "partition limit degraded");
                    self.metrics.record_degradation();
                }
                error!(
                    partition = partition_key,
                    limit = to,
                    reset_secs,
                    error = %cause,
                    "circuit breaker opened, pausing partition"
                );
                self.metrics.record_circuit_opened();
            }
            DegradationEvent::HalfOpened { limit } => {
                info!(partition = partition_key, limit, "circuit breaker reset, partition retrying");
                self.metrics.record_circuit_reset();
            }
            DegradationEvent::Recovered { from, to } => {
                info!(partition = partition_key, from, to, "partition recovering");
            }
            DegradationEvent::Closed { from, to } => {
                info!(partition = partition_key, from, to, "partition recovered to full limit");
            }
        }

        let (limit, percent) = {
            let state = throttle.state.lock();
            (
                state.effective_limit(self.partition_limit),
                state.limit_percent(self.partition_limit),
            )
        };
        throttle.resize(limit);
        self.metrics.set_limit_percent(partition_key, percent);
    }
}
