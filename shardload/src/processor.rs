use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::api::{ImportError, ImportStatus, ImportSummary};
use crate::config::{ConfigError, ImportConfig};
use crate::progress::{LoggingProgressReporter, ProgressReporter, ProgressSnapshot};
use crate::queue::FlushQueue;
use crate::record::Record;
use crate::router::PartitionRouter;
use crate::sink::StorageSink;
use crate::stats::{DroppedBatch, ImportMetrics, MetricsSnapshot};
use crate::throttler::HierarchicalThrottler;
use crate::time::{SystemTime, TimeSource};
use crate::worker::{PartitionWorker, WorkerContext};

/// Routes records to per-partition workers and drives one import run to completion.
pub struct ShardingProcessor {
    config: Arc<ImportConfig>,
    router: PartitionRouter,
    sink: Arc<dyn StorageSink>,
    cancel: CancellationToken,
    reporter: Option<Arc<dyn ProgressReporter>>,
    timesource: Box<dyn TimeSource + Send + Sync>,
    running: AtomicBool,
    metrics: RwLock<Arc<ImportMetrics>>,
    queues: DashMap<String, Arc<FlushQueue>>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ShardingProcessor {
    pub fn new(config: ImportConfig, sink: Arc<dyn StorageSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let router = PartitionRouter::new(config.processing.partition_count)?;

        Ok(ShardingProcessor {
            config: Arc::new(config),
            router,
            sink,
            cancel: CancellationToken::new(),
            reporter: Some(Arc::new(LoggingProgressReporter::new())),
            timesource: Box::new(SystemTime {}),
            running: AtomicBool::new(false),
            metrics: RwLock::new(Arc::new(ImportMetrics::default())),
            queues: DashMap::new(),
        })
    }

    /// Cancelling `token` stops the run at its next suspension point.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the default logging reporter, `None` disables progress reports.
    pub fn with_progress_reporter(mut self, reporter: Option<Arc<dyn ProgressReporter>>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_time_source(mut self, timesource: Box<dyn TimeSource + Send + Sync>) -> Self {
        self.timesource = timesource;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    /// Counters of the current run, or of the last one once it finished.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.read().snapshot()
    }

    pub fn dropped_batches(&self) -> Vec<DroppedBatch> {
        self.metrics.read().dropped_batches()
    }

    /// Batches waiting for a flush slot, per partition.
    pub fn pending_batch_counts(&self) -> HashMap<String, usize> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().pending()))
            .collect()
    }

    /// Route raw keys through the partition router and import them.
    ///
    /// Every partition of the router shows up in the summary, including those no key landed in.
    pub async fn process_keys<I, S>(&self, keys: I) -> Result<ImportSummary, ImportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let router = self.router;
        self.start(
            keys.into_iter().map(move |key| Record::routed(key, &router)),
            router.partition_keys(),
        )
        .await
    }

    /// Import `records`, returning once every one of them was written, dropped or cancelled.
    ///
    /// Progress is reported as a percentage only when the iterator knows its exact length.
    pub async fn process<I>(&self, records: I) -> Result<ImportSummary, ImportError>
    where
        I: IntoIterator<Item = Record>,
    {
        self.start(records, Vec::new()).await
    }

    async fn start<I>(&self, records: I, partitions: Vec<String>) -> Result<ImportSummary, ImportError>
    where
        I: IntoIterator<Item = Record>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ImportError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("import", %run_id);
        self.run(run_id, records.into_iter(), partitions)
            .instrument(span)
            .await
    }

    async fn run<I>(
        &self,
        run_id: Uuid,
        records: I,
        partitions: Vec<String>,
    ) -> Result<ImportSummary, ImportError>
    where
        I: Iterator<Item = Record>,
    {
        let expected = match records.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower as u64),
            _ => None,
        };

        let metrics = Arc::new(ImportMetrics::new(expected));
        for partition_key in &partitions {
            metrics.register_partition(partition_key);
        }
        *self.metrics.write() = metrics.clone();
        self.queues.clear();

        let throttler = Arc::new(HierarchicalThrottler::new(
            &self.config.throttling,
            self.config.degradation.clone(),
            metrics.clone(),
        ));
        let ctx = WorkerContext {
            config: self.config.clone(),
            sink: self.sink.clone(),
            throttler,
            metrics: metrics.clone(),
            cancel: self.cancel.clone(),
        };

        let started_at = self.timesource.current_time();
        info!(
            expected,
            partitions = self.router.partition_count(),
            global_limit = self.config.throttling.global_limit_per_second,
            partition_limit = self.config.throttling.partition_limit_per_second,
            "starting import"
        );

        let progress = self.reporter.clone().map(|reporter| {
            let metrics = metrics.clone();
            let period = self.config.progress_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // the first tick completes immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    reporter.report(&ProgressSnapshot::from_metrics(&metrics.snapshot()));
                }
            })
        });

        let mut workers: HashMap<String, PartitionWorker> = HashMap::new();
        for record in records {
            if self.cancel.is_cancelled() {
                break;
            }

            let partition_key = record.partition_key.clone();
            let worker = workers.entry(partition_key.clone()).or_insert_with(|| {
                let worker = PartitionWorker::spawn(&partition_key, ctx.clone());
                self.queues.insert(partition_key.clone(), worker.queue());
                worker
            });

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = worker.send(record) => sent.is_ok(),
            };
            if !sent {
                // the record never reached a worker, it is not part of the run
                break;
            }
            metrics.record_routed(&partition_key);
        }

        let mut finishing = JoinSet::new();
        for worker in workers.into_values() {
            finishing.spawn(worker.finish().in_current_span());
        }
        while let Some(res) = finishing.join_next().await {
            if let Err(err) = res {
                error!("partition worker failed to finish: {}", err);
            }
        }

        if let Some(progress) = progress {
            progress.abort();
        }

        let snapshot = metrics.snapshot();
        if let Some(reporter) = &self.reporter {
            reporter.report(&ProgressSnapshot::from_metrics(&snapshot));
        }

        let status = if self.cancel.is_cancelled() {
            ImportStatus::Cancelled
        } else {
            ImportStatus::Completed
        };

        info!(
            ?status,
            processed = snapshot.records_processed,
            inserted = snapshot.records_inserted,
            dropped = snapshot.records_dropped,
            cancelled = snapshot.records_cancelled,
            retried = snapshot.batches_retried,
            throughput = format!("{:.1}", snapshot.throughput_per_second),
            "import finished"
        );
        if let Some(load) = snapshot.load.as_ref().filter(|load| load.imbalanced) {
            warn!(
                max = load.max_records,
                min = load.min_records,
                spread_percent = format!("{:.1}", load.spread_percent),
                "partition load is imbalanced"
            );
        }

        let summary = ImportSummary {
            run_id,
            status,
            started_at,
            finished_at: self.timesource.current_time(),
            active_backoffs: snapshot.active_backoffs(),
            metrics: snapshot,
        };

        match status {
            ImportStatus::Completed => Ok(summary),
            ImportStatus::Cancelled => Err(ImportError::Cancelled(Box::new(summary))),
        }
    }
}
