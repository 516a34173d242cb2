use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::api::WriteError;
use crate::record::Record;

/// Destination of the batches, eg a partitioned key-value table.
///
/// Writes must be idempotent per key: a batch whose write outcome was lost can be written again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write_batch(&self, partition_key: &str, records: &[Record]) -> Result<(), WriteError>;
}

pub struct PrintSink {}

#[async_trait]
impl StorageSink for PrintSink {
    async fn write_batch(&self, partition_key: &str, records: &[Record]) -> Result<(), WriteError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of records", partition = partition_key);
        let _enter = span.enter();

        histogram!("shardload_print_batch_size", records.len() as f64);
        for record in records {
            info!("record: {}", record.key);
        }

        Ok(())
    }
}

/// Accepts everything and keeps nothing.
pub struct DiscardSink {}

#[async_trait]
impl StorageSink for DiscardSink {
    async fn write_batch(&self, _partition_key: &str, records: &[Record]) -> Result<(), WriteError> {
        counter!("shardload_discarded_records_total", records.len() as u64);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub partition_key: String,
    pub keys: Vec<String>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct FailurePlan {
    error: WriteError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct RecordingState {
    writes: Vec<WriteRecord>,
    attempts: HashMap<String, usize>,
    failures: HashMap<String, FailurePlan>,
}

// mockall expectations get verbose fast for stateful scenarios, this one just remembers
/// In-memory sink keeping every successful write, with scripted per-partition failures.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingState>>,
    latency: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the time a write takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` writes to `partition_key`, or every write when `times` is `None`.
    pub fn fail_partition(&self, partition_key: &str, error: WriteError, times: Option<usize>) {
        self.state.lock().failures.insert(
            partition_key.to_string(),
            FailurePlan {
                error,
                remaining: times,
            },
        );
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn written_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .flat_map(|w| w.keys.iter().cloned())
            .collect()
    }

    /// Write attempts, failed ones included.
    pub fn attempts(&self, partition_key: &str) -> usize {
        self.state
            .lock()
            .attempts
            .get(partition_key)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn write_batch(&self, partition_key: &str, records: &[Record]) -> Result<(), WriteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock();
        *state.attempts.entry(partition_key.to_string()).or_default() += 1;

        if let Some(plan) = state.failures.get_mut(partition_key) {
            match plan.remaining {
                None => return Err(plan.error.clone()),
                Some(0) => {}
                Some(ref mut remaining) => {
                    *remaining -= 1;
                    return Err(plan.error.clone());
                }
            }
        }

        state.writes.push(WriteRecord {
            partition_key: partition_key.to_string(),
            keys: records.iter().map(|r| r.key.clone()).collect(),
            at: Instant::now(),
        });
        Ok(())
    }
}
