use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::stats::MetricsSnapshot;

// Define the public result and error types of an import run here.

/// Errors a [`StorageSink`](crate::sink::StorageSink) can report for one batch write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Timeouts, throttling responses and other failures worth retrying.
    #[error("retryable storage error: {0}")]
    Retryable(String),
    /// The batch can never be written as-is; it is dropped without retrying.
    #[error("non-retryable storage error: {0}")]
    NonRetryable(String),
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Retryable(_))
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("import cancelled after {} of {} records were inserted", .0.metrics.records_inserted, .0.metrics.records_processed)]
    Cancelled(Box<ImportSummary>),
    #[error("an import is already running on this processor")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Completed,
    Cancelled,
}

/// Final report of one [`ShardingProcessor::process`](crate::processor::ShardingProcessor::process) run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub status: ImportStatus,
    pub started_at: String,
    pub finished_at: String,
    pub metrics: MetricsSnapshot,
    /// Partitions still holding a non-zero backoff delay when the run ended.
    pub active_backoffs: usize,
}

impl ImportSummary {
    /// Every routed record ends up inserted, dropped or cancelled.
    pub fn is_fully_accounted(&self) -> bool {
        let m = &self.metrics;
        m.records_processed == m.records_inserted + m.records_dropped + m.records_cancelled
    }
}
