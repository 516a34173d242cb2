use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::stats::MetricsSnapshot;

const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionBackoffState {
    pub partition_key: String,
    pub backoff_ms: u64,
}

/// Point-in-time view of a running import.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Only known when the input reported its exact size.
    pub percent: Option<f64>,
    pub completed: u64,
    pub total: Option<u64>,
    pub throughput_per_second: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    /// Partitions currently backing off.
    pub backoffs: Vec<PartitionBackoffState>,
}

impl ProgressSnapshot {
    pub fn from_metrics(metrics: &MetricsSnapshot) -> Self {
        ProgressSnapshot {
            percent: metrics.percent_complete(),
            completed: metrics.records_completed(),
            total: metrics.records_expected,
            throughput_per_second: metrics.throughput_per_second,
            eta: metrics
                .eta_secs
                .filter(|secs| secs.is_finite())
                .map(Duration::from_secs_f64),
            elapsed: Duration::from_millis(metrics.elapsed_ms),
            backoffs: metrics
                .partitions
                .iter()
                .filter(|p| p.backoff_ms > 0)
                .map(|p| PartitionBackoffState {
                    partition_key: p.partition_key.clone(),
                    backoff_ms: p.backoff_ms,
                })
                .collect(),
        }
    }
}

/// Receives a snapshot every progress interval and once when the import ends.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Logs a progress bar, only when the whole percentage moved.
#[derive(Default)]
pub struct LoggingProgressReporter {
    last: Mutex<Option<u64>>,
}

impl LoggingProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn render_bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64).floor() as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

impl ProgressReporter for LoggingProgressReporter {
    fn report(&self, snapshot: &ProgressSnapshot) {
        // without a total, fall back to logging whenever the completed count moved
        let position = match snapshot.percent {
            Some(percent) => percent.floor() as u64,
            None => snapshot.completed,
        };
        {
            let mut last = self.last.lock();
            if *last == Some(position) {
                return;
            }
            *last = Some(position);
        }

        let eta_secs = snapshot.eta.map(|eta| eta.as_secs());
        match (snapshot.percent, snapshot.total) {
            (Some(percent), Some(total)) => info!(
                completed = snapshot.completed,
                total,
                throughput = format!("{:.1}", snapshot.throughput_per_second),
                eta_secs,
                backoffs = snapshot.backoffs.len(),
                "{} {:.0}%",
                render_bar(percent),
                percent
            ),
            _ => info!(
                completed = snapshot.completed,
                throughput = format!("{:.1}", snapshot.throughput_per_second),
                backoffs = snapshot.backoffs.len(),
                "import progress"
            ),
        }
    }
}
