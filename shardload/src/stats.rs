//! In-process counters of one import run.
//!
//! Everything is an atomic so flush slots of every partition can update it without coordination.
//! A fresh [`ImportMetrics`] is created per run; [`ImportMetrics::snapshot`] produces the
//! serialisable view used by progress reports and the final summary.
//!
//! Updates are mirrored to the `metrics` facade so a host can export them with any recorder.
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Spread between the busiest and the least busy partition above which the load counts as
/// imbalanced, in percent of the busiest.
pub const IMBALANCE_THRESHOLD_PERCENT: f64 = 20.0;

/// A batch given up on after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedBatch {
    pub partition_key: String,
    pub keys: Vec<String>,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug)]
pub struct PartitionStats {
    records_routed: AtomicU64,
    records_inserted: AtomicU64,
    records_failed: AtomicU64,
    batches_written: AtomicU64,
    batches_failed: AtomicU64,
    batches_retried: AtomicU64,
    batches_dropped: AtomicU64,
    min_batch_size: AtomicUsize,
    max_batch_size: AtomicUsize,
    max_throughput: AtomicU64,
    limit_percent: AtomicU32,
    backoff_ms: AtomicU64,
    backpressure_events: AtomicU64,
    throttle_waits: AtomicU64,
    throttle_wait_ms: AtomicU64,
    queue_depth: AtomicUsize,
    max_queue_depth: AtomicUsize,
}

impl Default for PartitionStats {
    fn default() -> Self {
        PartitionStats {
            records_routed: AtomicU64::new(0),
            records_inserted: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_retried: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            min_batch_size: AtomicUsize::new(usize::MAX),
            max_batch_size: AtomicUsize::new(0),
            max_throughput: AtomicU64::new(0),
            limit_percent: AtomicU32::new(100),
            backoff_ms: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            throttle_waits: AtomicU64::new(0),
            throttle_wait_ms: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            max_queue_depth: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSummary {
    pub partition_key: String,
    pub records_routed: u64,
    pub records_inserted: u64,
    pub records_failed: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub batches_retried: u64,
    pub batches_dropped: u64,
    pub min_batch_size: Option<usize>,
    pub max_batch_size: usize,
    pub avg_batch_size: f64,
    /// Highest number of records written within one second.
    pub max_throughput: u64,
    /// Effective limit as a percentage of the configured partition limit.
    pub current_limit_percent: u32,
    pub backoff_ms: u64,
    /// Times a producer had to wait for room in the partition's buffers.
    pub backpressure_events: u64,
    pub throttle_waits: u64,
    pub throttle_wait_ms: u64,
    /// Batches waiting for a flush slot at the last observation.
    pub queue_depth: usize,
    pub max_queue_depth: usize,
}

/// How evenly routed records are spread over partitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadDistribution {
    pub max_records: u64,
    pub min_records: u64,
    /// `(max - min) / max`, in percent.
    pub spread_percent: f64,
    pub imbalanced: bool,
}

impl LoadDistribution {
    pub fn from_counts(counts: impl IntoIterator<Item = u64>) -> Option<Self> {
        let mut counts = counts.into_iter();
        let first = counts.next()?;
        let (min, max) = counts.fold((first, first), |(min, max), c| (min.min(c), max.max(c)));

        let spread_percent = if max == 0 {
            0.0
        } else {
            (max - min) as f64 * 100.0 / max as f64
        };

        Some(LoadDistribution {
            max_records: max,
            min_records: min,
            spread_percent,
            imbalanced: spread_percent > IMBALANCE_THRESHOLD_PERCENT,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub elapsed_ms: u64,
    pub records_expected: Option<u64>,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_failed: u64,
    pub records_dropped: u64,
    pub records_cancelled: u64,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub batches_retried: u64,
    pub batches_dropped: u64,
    pub backoff_events: u64,
    pub throttle_waits: u64,
    pub throttle_wait_ms: u64,
    pub degradation_events: u64,
    pub circuit_openings: u64,
    pub circuit_resets: u64,
    /// Inserted records per second since the run started.
    pub throughput_per_second: f64,
    pub eta_secs: Option<f64>,
    pub partitions: Vec<PartitionSummary>,
    pub load: Option<LoadDistribution>,
}

impl MetricsSnapshot {
    /// Records that reached a final outcome.
    pub fn records_completed(&self) -> u64 {
        self.records_inserted + self.records_dropped + self.records_cancelled
    }

    pub fn percent_complete(&self) -> Option<f64> {
        let expected = self.records_expected?;
        if expected == 0 {
            return Some(100.0);
        }
        Some((self.records_completed() as f64 * 100.0 / expected as f64).min(100.0))
    }

    pub fn active_backoffs(&self) -> usize {
        self.partitions.iter().filter(|p| p.backoff_ms > 0).count()
    }
}

#[derive(Debug)]
pub struct ImportMetrics {
    started: Instant,
    records_expected: Option<u64>,

    records_processed: AtomicU64,
    records_inserted: AtomicU64,
    records_failed: AtomicU64,
    records_dropped: AtomicU64,
    records_cancelled: AtomicU64,

    batches_written: AtomicU64,
    batches_failed: AtomicU64,
    batches_retried: AtomicU64,
    batches_dropped: AtomicU64,

    backoff_events: AtomicU64,
    throttle_waits: AtomicU64,
    throttle_wait_ms: AtomicU64,
    degradation_events: AtomicU64,
    circuit_openings: AtomicU64,
    circuit_resets: AtomicU64,

    partitions: DashMap<String, PartitionStats>,
    dropped: Mutex<Vec<DroppedBatch>>,
}

impl Default for ImportMetrics {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ImportMetrics {
    pub fn new(records_expected: Option<u64>) -> Self {
        ImportMetrics {
            started: Instant::now(),
            records_expected,
            records_processed: AtomicU64::new(0),
            records_inserted: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            records_cancelled: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_retried: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            backoff_events: AtomicU64::new(0),
            throttle_waits: AtomicU64::new(0),
            throttle_wait_ms: AtomicU64::new(0),
            degradation_events: AtomicU64::new(0),
            circuit_openings: AtomicU64::new(0),
            circuit_resets: AtomicU64::new(0),
            partitions: DashMap::new(),
            dropped: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn with_partition(&self, partition_key: &str, f: impl FnOnce(&PartitionStats)) {
        if let Some(stats) = self.partitions.get(partition_key) {
            f(stats.value());
            return;
        }
        let stats = self
            .partitions
            .entry(partition_key.to_string())
            .or_default();
        f(stats.value());
    }

    /// Make `partition_key` part of the summary even if no record is ever routed to it.
    pub fn register_partition(&self, partition_key: &str) {
        self.with_partition(partition_key, |_| {});
    }

    pub fn record_routed(&self, partition_key: &str) {
        counter!("shardload_records_routed_total", 1, "partition" => partition_key.to_string());
        self.records_processed.fetch_add(1, Ordering::Relaxed);
        self.with_partition(partition_key, |p| {
            p.records_routed.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_batch_written(&self, partition_key: &str, size: usize) {
        histogram!("shardload_batch_size", size as f64);
        counter!("shardload_records_inserted_total", size as u64, "partition" => partition_key.to_string());
        counter!("shardload_batches_written_total", 1);
        self.records_inserted
            .fetch_add(size as u64, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.with_partition(partition_key, |p| {
            p.records_inserted.fetch_add(size as u64, Ordering::Relaxed);
            p.batches_written.fetch_add(1, Ordering::Relaxed);
            p.min_batch_size.fetch_min(size, Ordering::Relaxed);
            p.max_batch_size.fetch_max(size, Ordering::Relaxed);
        });
    }

    pub fn record_batch_failed(&self, partition_key: &str, size: usize) {
        counter!("shardload_batches_failed_total", 1, "partition" => partition_key.to_string());
        self.records_failed.fetch_add(size as u64, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.with_partition(partition_key, |p| {
            p.records_failed.fetch_add(size as u64, Ordering::Relaxed);
            p.batches_failed.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_batch_retried(&self, partition_key: &str) {
        counter!("shardload_batches_retried_total", 1);
        self.batches_retried.fetch_add(1, Ordering::Relaxed);
        self.with_partition(partition_key, |p| {
            p.batches_retried.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_batch_dropped(&self, dropped: DroppedBatch) {
        let size = dropped.keys.len() as u64;
        counter!("shardload_batches_dropped_total", 1, "partition" => dropped.partition_key.clone());
        counter!("shardload_records_dropped_total", size);
        self.records_dropped.fetch_add(size, Ordering::Relaxed);
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.with_partition(&dropped.partition_key, |p| {
            p.batches_dropped.fetch_add(1, Ordering::Relaxed);
        });
        self.dropped.lock().push(dropped);
    }

    pub fn record_cancelled(&self, records: usize) {
        counter!("shardload_records_cancelled_total", records as u64);
        self.records_cancelled
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_backoff(&self, partition_key: &str, delay: Duration) {
        counter!("shardload_backoff_events_total", 1, "partition" => partition_key.to_string());
        self.backoff_events.fetch_add(1, Ordering::Relaxed);
        self.set_backoff(partition_key, delay);
    }

    pub fn set_backoff(&self, partition_key: &str, delay: Duration) {
        gauge!("shardload_partition_backoff_ms", delay.as_millis() as f64, "partition" => partition_key.to_string());
        self.with_partition(partition_key, |p| {
            p.backoff_ms
                .store(delay.as_millis() as u64, Ordering::Relaxed);
        });
    }

    pub fn record_throttle_wait(&self, partition_key: &str, waited: Duration) {
        histogram!("shardload_throttle_wait_seconds", waited.as_secs_f64(), "partition" => partition_key.to_string());
        let waited_ms = waited.as_millis() as u64;
        self.throttle_waits.fetch_add(1, Ordering::Relaxed);
        self.throttle_wait_ms.fetch_add(waited_ms, Ordering::Relaxed);
        self.with_partition(partition_key, |p| {
            p.throttle_waits.fetch_add(1, Ordering::Relaxed);
            p.throttle_wait_ms.fetch_add(waited_ms, Ordering::Relaxed);
        });
    }

    pub fn record_backpressure(&self, partition_key: &str) {
        counter!("shardload_backpressure_events_total", 1, "partition" => partition_key.to_string());
        self.with_partition(partition_key, |p| {
            p.backpressure_events.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Current number of batches waiting for a flush slot, the peak is kept as well.
    pub fn observe_queue_depth(&self, partition_key: &str, depth: usize) {
        gauge!("shardload_partition_queue_depth", depth as f64, "partition" => partition_key.to_string());
        self.with_partition(partition_key, |p| {
            p.queue_depth.store(depth, Ordering::Relaxed);
            p.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
        });
    }

    pub fn record_degradation(&self) {
        counter!("shardload_degradation_events_total", 1);
        self.degradation_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_opened(&self) {
        counter!("shardload_circuit_openings_total", 1);
        self.circuit_openings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_reset(&self) {
        counter!("shardload_circuit_resets_total", 1);
        self.circuit_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_limit_percent(&self, partition_key: &str, percent: u32) {
        gauge!("shardload_partition_limit_percent", percent as f64, "partition" => partition_key.to_string());
        self.with_partition(partition_key, |p| {
            p.limit_percent.store(percent, Ordering::Relaxed);
        });
    }

    /// Keep the highest one-second throughput seen for the partition.
    pub fn observe_throughput(&self, partition_key: &str, records_per_second: u64) {
        self.with_partition(partition_key, |p| {
            p.max_throughput
                .fetch_max(records_per_second, Ordering::Relaxed);
        });
    }

    pub fn dropped_batches(&self) -> Vec<DroppedBatch> {
        self.dropped.lock().clone()
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn records_inserted(&self) -> u64 {
        self.records_inserted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.elapsed();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let mut partitions: Vec<PartitionSummary> = self
            .partitions
            .iter()
            .map(|entry| {
                let p = entry.value();
                let written = load(&p.batches_written);
                let inserted = load(&p.records_inserted);
                let min = p.min_batch_size.load(Ordering::Relaxed);

                PartitionSummary {
                    partition_key: entry.key().clone(),
                    records_routed: load(&p.records_routed),
                    records_inserted: inserted,
                    records_failed: load(&p.records_failed),
                    batches_written: written,
                    batches_failed: load(&p.batches_failed),
                    batches_retried: load(&p.batches_retried),
                    batches_dropped: load(&p.batches_dropped),
                    min_batch_size: (min != usize::MAX).then_some(min),
                    max_batch_size: p.max_batch_size.load(Ordering::Relaxed),
                    avg_batch_size: if written == 0 {
                        0.0
                    } else {
                        inserted as f64 / written as f64
                    },
                    max_throughput: load(&p.max_throughput),
                    current_limit_percent: p.limit_percent.load(Ordering::Relaxed),
                    backoff_ms: load(&p.backoff_ms),
                    backpressure_events: load(&p.backpressure_events),
                    throttle_waits: load(&p.throttle_waits),
                    throttle_wait_ms: load(&p.throttle_wait_ms),
                    queue_depth: p.queue_depth.load(Ordering::Relaxed),
                    max_queue_depth: p.max_queue_depth.load(Ordering::Relaxed),
                }
            })
            .collect();
        partitions.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));

        let distribution = LoadDistribution::from_counts(partitions.iter().map(|p| p.records_routed));

        let records_inserted = load(&self.records_inserted);
        let secs = elapsed.as_secs_f64();
        let throughput_per_second = if secs > 0.0 {
            records_inserted as f64 / secs
        } else {
            0.0
        };

        let mut snapshot = MetricsSnapshot {
            elapsed_ms: elapsed.as_millis() as u64,
            records_expected: self.records_expected,
            records_processed: load(&self.records_processed),
            records_inserted,
            records_failed: load(&self.records_failed),
            records_dropped: load(&self.records_dropped),
            records_cancelled: load(&self.records_cancelled),
            batches_written: load(&self.batches_written),
            batches_failed: load(&self.batches_failed),
            batches_retried: load(&self.batches_retried),
            batches_dropped: load(&self.batches_dropped),
            backoff_events: load(&self.backoff_events),
            throttle_waits: load(&self.throttle_waits),
            throttle_wait_ms: load(&self.throttle_wait_ms),
            degradation_events: load(&self.degradation_events),
            circuit_openings: load(&self.circuit_openings),
            circuit_resets: load(&self.circuit_resets),
            throughput_per_second,
            eta_secs: None,
            partitions,
            load: distribution,
        };

        snapshot.eta_secs = self.records_expected.and_then(|expected| {
            let remaining = expected.saturating_sub(snapshot.records_completed());
            if remaining == 0 {
                Some(0.0)
            } else if throughput_per_second > 0.0 {
                Some(remaining as f64 / throughput_per_second)
            } else {
                None
            }
        });

        snapshot
    }
}
