//! One worker per partition: a batcher task turning records into batches and a fixed number of
//! flush slots writing them through the throttler.
//!
//! Everything a partition does to slow itself down (backoff, circuit waits, token waits) happens
//! inside its own tasks, so a struggling partition never holds up another one.
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::api::WriteError;
use crate::backoff::{BackoffPolicy, PartitionBackoff};
use crate::config::ImportConfig;
use crate::degradation::CircuitState;
use crate::queue::{BatchSender, FlushQueue};
use crate::record::{Batch, Record};
use crate::sink::StorageSink;
use crate::stats::{DroppedBatch, ImportMetrics};
use crate::throttler::HierarchicalThrottler;

/// State shared by every worker of one import run.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<ImportConfig>,
    pub sink: Arc<dyn StorageSink>,
    pub throttler: Arc<HierarchicalThrottler>,
    pub metrics: Arc<ImportMetrics>,
    pub cancel: CancellationToken,
}

/// Records written by a partition in the current one-second window.
struct ThroughputWindow {
    started: Instant,
    records: u64,
}

impl ThroughputWindow {
    fn new() -> Self {
        ThroughputWindow {
            started: Instant::now(),
            records: 0,
        }
    }

    /// Count `records` and return the running total of the window they fall in.
    fn add(&mut self, records: u64, now: Instant) -> u64 {
        if now.saturating_duration_since(self.started) >= Duration::from_secs(1) {
            self.started = now;
            self.records = 0;
        }
        self.records += records;
        self.records
    }
}

struct FlushSlot {
    partition_key: String,
    queue: Arc<FlushQueue>,
    backoff: Arc<PartitionBackoff>,
    policy: BackoffPolicy,
    window: Arc<Mutex<ThroughputWindow>>,
    ctx: WorkerContext,
}

pub struct PartitionWorker {
    partition_key: String,
    records: mpsc::Sender<Record>,
    queue: Arc<FlushQueue>,
    backoff: Arc<PartitionBackoff>,
    metrics: Arc<ImportMetrics>,
    tasks: JoinSet<()>,
}

impl PartitionWorker {
    /// Start the batcher and the flush slots of `partition_key`.
    pub fn spawn(partition_key: &str, ctx: WorkerContext) -> PartitionWorker {
        let processing = &ctx.config.processing;
        let (records_tx, records_rx) = mpsc::channel(processing.channel_capacity.max(1));
        let (batches, queue) = FlushQueue::new(processing.batch_queue_capacity);
        let queue = Arc::new(queue);
        let backoff = Arc::new(PartitionBackoff::new());
        let window = Arc::new(Mutex::new(ThroughputWindow::new()));
        let policy = BackoffPolicy::new(&ctx.config.backoff);

        let span = tracing::info_span!("partition", partition = partition_key);
        let mut tasks = JoinSet::new();

        tasks.spawn(
            run_batcher(
                partition_key.to_string(),
                records_rx,
                batches,
                processing.batch_size.max(1),
                ctx.metrics.clone(),
                ctx.cancel.clone(),
            )
            .instrument(span.clone()),
        );

        for slot in 0..processing.flush_worker_count.max(1) {
            let flush = FlushSlot {
                partition_key: partition_key.to_string(),
                queue: queue.clone(),
                backoff: backoff.clone(),
                policy: policy.clone(),
                window: window.clone(),
                ctx: ctx.clone(),
            };
            tasks.spawn(
                flush
                    .run()
                    .instrument(tracing::debug_span!(parent: &span, "flush_slot", slot)),
            );
        }

        debug!(partition = partition_key, "partition worker started");

        PartitionWorker {
            partition_key: partition_key.to_string(),
            records: records_tx,
            queue,
            backoff,
            metrics: ctx.metrics,
            tasks,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn queue(&self) -> Arc<FlushQueue> {
        self.queue.clone()
    }

    pub fn backoff(&self) -> Duration {
        self.backoff.current()
    }

    /// Hand a record to the batcher, waiting while the partition's buffer is full.
    ///
    /// Gives the record back once the worker stopped accepting records.
    pub async fn send(&self, record: Record) -> Result<(), Record> {
        match self.records.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(record)) => Err(record),
            Err(TrySendError::Full(record)) => {
                self.metrics.record_backpressure(&self.partition_key);
                self.records.send(record).await.map_err(|err| err.0)
            }
        }
    }

    /// Stop accepting records and wait until every batch was written, dropped or cancelled.
    pub async fn finish(self) {
        let PartitionWorker {
            partition_key,
            records,
            queue,
            metrics,
            mut tasks,
            ..
        } = self;
        drop(records);

        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(partition = partition_key, "partition task failed: {}", err);
            }
        }

        // only non-empty when the run was cancelled
        let left: usize = queue.drain().await.iter().map(Batch::len).sum();
        if left > 0 {
            metrics.record_cancelled(left);
        }
        debug!(partition = partition_key, "partition worker finished");
    }
}

async fn run_batcher(
    partition_key: String,
    mut records: mpsc::Receiver<Record>,
    batches: BatchSender,
    batch_size: usize,
    metrics: Arc<ImportMetrics>,
    cancel: CancellationToken,
) {
    let mut buffer = Vec::with_capacity(batch_size);

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancel_buffered(&mut records, buffer.len(), &metrics);
                return;
            }
            record = records.recv() => record,
        };

        let Some(record) = record else {
            break;
        };
        buffer.push(record);

        if buffer.len() >= batch_size {
            let full = mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            if !enqueue(&batches, Batch::new(partition_key.as_str(), full), &metrics, &cancel).await {
                cancel_buffered(&mut records, 0, &metrics);
                return;
            }
        }
    }

    if !buffer.is_empty() {
        enqueue(&batches, Batch::new(partition_key, buffer), &metrics, &cancel).await;
    }
}

/// Returns false when the batch could not be queued because the run is being cancelled.
async fn enqueue(
    batches: &BatchSender,
    batch: Batch,
    metrics: &ImportMetrics,
    cancel: &CancellationToken,
) -> bool {
    let partition_key = batch.partition_key.clone();
    let batch = match batches.try_send(batch) {
        Ok(()) => {
            metrics.observe_queue_depth(&partition_key, batches.queued());
            return true;
        }
        Err(TrySendError::Closed(batch)) => {
            metrics.record_cancelled(batch.len());
            return false;
        }
        Err(TrySendError::Full(batch)) => {
            metrics.record_backpressure(&partition_key);
            batch
        }
    };

    let size = batch.len();
    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            metrics.record_cancelled(size);
            return false;
        }
        sent = batches.send(batch) => sent,
    };

    match sent {
        Ok(()) => {
            metrics.observe_queue_depth(&partition_key, batches.queued());
            true
        }
        Err(batch) => {
            metrics.record_cancelled(batch.len());
            false
        }
    }
}

fn cancel_buffered(records: &mut mpsc::Receiver<Record>, buffered: usize, metrics: &ImportMetrics) {
    records.close();

    let mut cancelled = buffered;
    while records.try_recv().is_ok() {
        cancelled += 1;
    }
    if cancelled > 0 {
        metrics.record_cancelled(cancelled);
    }
}

impl FlushSlot {
    async fn run(self) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.ctx
                .metrics
                .observe_queue_depth(&self.partition_key, self.queue.pending());

            self.flush(batch).await;
        }
    }

    async fn flush(&self, mut batch: Batch) {
        let key = self.partition_key.as_str();
        let throttler = &self.ctx.throttler;

        let delay = self.backoff.current();
        if !delay.is_zero() && !self.pause(delay).await {
            return self.abandon(batch);
        }

        while throttler.poll_circuit(key) == CircuitState::Open {
            if !self.pause(self.ctx.config.degradation.poll_interval()).await {
                return self.abandon(batch);
            }
        }

        let tokens = batch.len().min(u32::MAX as usize) as u32;
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => return self.abandon(batch),
            _ = throttler.acquire(key, tokens) => {}
        }

        // an in-flight write is allowed to finish even if the run gets cancelled
        let started = Instant::now();
        let result = self.write(&batch).await;

        match result {
            Ok(()) => {
                debug!(
                    records = batch.len(),
                    attempt = batch.attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch written"
                );
                self.ctx.metrics.record_batch_written(key, batch.len());
                throttler.record_success(key);

                let delay = self.backoff.halve();
                self.ctx.metrics.set_backoff(key, delay);

                let written = self.window.lock().add(batch.len() as u64, Instant::now());
                self.ctx.metrics.observe_throughput(key, written);

                self.queue.complete();
            }
            Err(err) => {
                self.ctx.metrics.record_batch_failed(key, batch.len());

                if !err.is_retryable() {
                    return self.give_up(batch, &err);
                }

                throttler.record_error(key, &err);
                let delay = self.policy.delay_for_attempt(batch.attempt);
                self.backoff.set(delay);
                self.ctx.metrics.record_backoff(key, delay);

                if !self.policy.should_retry(batch.attempt) {
                    return self.give_up(batch, &err);
                }

                warn!(
                    attempt = batch.attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "batch write failed, retrying"
                );
                batch.attempt += 1;
                self.ctx.metrics.record_batch_retried(key);
                self.queue.retry(batch);
                self.ctx.metrics.observe_queue_depth(key, self.queue.pending());
            }
        }
    }

    /// Write `batch` on its own task so a panicking sink fails the batch instead of the slot.
    async fn write(&self, batch: &Batch) -> Result<(), WriteError> {
        let sink = self.ctx.sink.clone();
        let partition_key = self.partition_key.clone();
        let records = batch.records.clone();

        let write = tokio::spawn(
            async move { sink.write_batch(&partition_key, &records).await }.in_current_span(),
        );

        match write.await {
            Ok(result) => result,
            Err(err) => {
                error!(records = batch.len(), "storage write did not complete: {}", err);
                Err(WriteError::NonRetryable(format!("storage write did not complete: {err}")))
            }
        }
    }

    /// Sleep unless the run gets cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn abandon(&self, batch: Batch) {
        self.ctx.metrics.record_cancelled(batch.len());
        self.queue.complete();
    }

    fn give_up(&self, batch: Batch, err: &WriteError) {
        let attempts = batch.attempt + 1;
        error!(
            records = batch.len(),
            attempts,
            error = %err,
            "dropping batch"
        );

        self.ctx.metrics.record_batch_dropped(DroppedBatch {
            partition_key: batch.partition_key.clone(),
            keys: batch.keys(),
            attempts,
            last_error: err.to_string(),
        });
        self.queue.complete();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{AdaptiveDegradationConfig, BackoffConfig, ImportConfig};
    use crate::sink::{MockStorageSink, RecordingSink};

    fn config() -> ImportConfig {
        let mut config = ImportConfig::default();
        config.processing.batch_size = 10;
        config.processing.flush_worker_count = 2;
        config.throttling.partition_limit_per_second = 10_000;
        config.throttling.global_limit_per_second = 100_000;
        config.backoff = BackoffConfig {
            base_ms: 10,
            max_ms: 100,
            max_retries: 2,
            jitter: 0.0,
        };
        config
    }

    fn context(config: ImportConfig, sink: Arc<dyn StorageSink>) -> WorkerContext {
        let metrics = Arc::new(ImportMetrics::new(None));
        let throttler = Arc::new(HierarchicalThrottler::new(
            &config.throttling,
            config.degradation.clone(),
            metrics.clone(),
        ));
        WorkerContext {
            config: Arc::new(config),
            sink,
            throttler,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    async fn feed(worker: &PartitionWorker, metrics: &ImportMetrics, count: usize) {
        for i in 0..count {
            let record = Record::new(worker.partition_key(), format!("site{i}.com"));
            worker.send(record).await.expect("worker accepts records");
            metrics.record_routed(worker.partition_key());
        }
    }

    #[test]
    fn throughput_window_rolls_every_second() {
        let start = Instant::now();
        let mut window = ThroughputWindow {
            started: start,
            records: 0,
        };

        assert_eq!(window.add(100, start), 100);
        assert_eq!(window.add(50, start + Duration::from_millis(900)), 150);
        assert_eq!(window.add(10, start + Duration::from_millis(1_000)), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_every_record_in_batches() {
        let sink = RecordingSink::new();
        let ctx = context(config(), Arc::new(sink.clone()));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_00", ctx);

        feed(&worker, &metrics, 25).await;
        worker.finish().await;

        let mut keys = sink.written_keys();
        keys.sort();
        assert_eq!(keys.len(), 25);
        keys.dedup();
        assert_eq!(keys.len(), 25);

        let sizes: Vec<usize> = sink.writes().iter().map(|w| w.keys.len()).collect();
        assert!(sizes.iter().all(|s| *s <= 10));
        assert_eq!(sizes.iter().filter(|s| **s == 5).count(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_inserted, 25);
        assert_eq!(snapshot.batches_written, 3);
        assert_eq!(snapshot.records_completed(), snapshot.records_processed);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_then_written() {
        let sink = RecordingSink::new();
        sink.fail_partition(
            "partition_01",
            WriteError::Retryable("throttled".to_string()),
            Some(2),
        );
        let ctx = context(config(), Arc::new(sink.clone()));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_01", ctx);

        feed(&worker, &metrics, 10).await;
        worker.finish().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_inserted, 10);
        assert_eq!(snapshot.batches_failed, 2);
        assert_eq!(snapshot.batches_retried, 2);
        assert_eq!(snapshot.batches_dropped, 0);
        assert_eq!(snapshot.backoff_events, 2);
        assert_eq!(sink.attempts("partition_01"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_the_batch() {
        let sink = RecordingSink::new();
        sink.fail_partition(
            "partition_02",
            WriteError::Retryable("throttled".to_string()),
            None,
        );
        let mut config = config();
        config.degradation = AdaptiveDegradationConfig::disabled();
        let ctx = context(config, Arc::new(sink.clone()));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_02", ctx);

        feed(&worker, &metrics, 10).await;
        worker.finish().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_inserted, 0);
        assert_eq!(snapshot.records_dropped, 10);
        assert_eq!(snapshot.batches_dropped, 1);
        // first attempt plus max_retries
        assert_eq!(sink.attempts("partition_02"), 3);

        let dropped = metrics.dropped_batches();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].attempts, 3);
        assert_eq!(dropped[0].keys.len(), 10);
        assert!(dropped[0].last_error.contains("throttled"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_drop_without_degrading() {
        let mut sink = MockStorageSink::new();
        sink.expect_write_batch()
            .times(1)
            .returning(|_, _| Err(WriteError::NonRetryable("entity too large".to_string())));
        let ctx = context(config(), Arc::new(sink));
        let metrics = ctx.metrics.clone();
        let throttler = ctx.throttler.clone();
        let worker = PartitionWorker::spawn("partition_03", ctx);

        feed(&worker, &metrics, 10).await;
        worker.finish().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_dropped, 10);
        assert_eq!(snapshot.batches_retried, 0);
        assert_eq!(snapshot.degradation_events, 0);
        assert_eq!(throttler.circuit_state("partition_03"), CircuitState::Closed);
    }

    /// Panics on its first write and accepts every later one.
    struct PanicOnceSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StorageSink for PanicOnceSink {
        async fn write_batch(&self, _partition_key: &str, _records: &[Record]) -> Result<(), WriteError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("connection pool poisoned");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sink_drops_the_batch_and_keeps_going() {
        let sink = PanicOnceSink {
            calls: AtomicUsize::new(0),
        };
        let ctx = context(config(), Arc::new(sink));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_07", ctx);

        feed(&worker, &metrics, 30).await;
        let finished = tokio::time::timeout(Duration::from_secs(3_600), worker.finish()).await;
        assert!(finished.is_ok(), "worker never finished");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_inserted, 20);
        assert_eq!(snapshot.records_dropped, 10);
        assert_eq!(snapshot.records_completed(), 30);

        let dropped = metrics.dropped_batches();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].attempts, 1);
        assert!(dropped[0].last_error.contains("did not complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffers_count_as_backpressure() {
        let sink = RecordingSink::new().with_latency(Duration::from_millis(500));
        let mut config = config();
        config.processing.channel_capacity = 5;
        config.processing.batch_queue_capacity = 2;
        config.processing.flush_worker_count = 1;
        let ctx = context(config, Arc::new(sink));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_08", ctx);

        feed(&worker, &metrics, 100).await;
        worker.finish().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_inserted, 100);
        let partition = &snapshot.partitions[0];
        assert!(partition.backpressure_events > 0);
        assert_eq!(partition.max_queue_depth, 2);
        assert_eq!(partition.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_accounts_every_record() {
        let sink = RecordingSink::new().with_latency(Duration::from_millis(50));
        let ctx = context(config(), Arc::new(sink.clone()));
        let metrics = ctx.metrics.clone();
        let cancel = ctx.cancel.clone();
        let worker = PartitionWorker::spawn("partition_04", ctx);

        feed(&worker, &metrics, 95).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        worker.finish().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_processed, 95);
        assert!(snapshot.records_cancelled > 0);
        assert!(snapshot.records_inserted < 95);
        assert_eq!(snapshot.records_completed(), 95);
        assert_eq!(sink.written_keys().len() as u64, snapshot.records_inserted);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_pauses_the_partition() {
        let sink = RecordingSink::new();
        sink.fail_partition(
            "partition_05",
            WriteError::Retryable("service unavailable".to_string()),
            Some(2),
        );
        let mut config = config();
        config.backoff.max_retries = 5;
        let ctx = context(config, Arc::new(sink.clone()));
        let metrics = ctx.metrics.clone();
        let worker = PartitionWorker::spawn("partition_05", ctx);

        let started = Instant::now();
        feed(&worker, &metrics, 10).await;
        worker.finish().await;

        // two errors open the circuit, the retry waits for the reset interval
        assert!(started.elapsed() >= Duration::from_secs(300));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.circuit_openings, 1);
        assert_eq!(snapshot.circuit_resets, 1);
        assert_eq!(snapshot.records_inserted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn send_blocks_when_the_buffer_is_full() {
        let sink = RecordingSink::new().with_latency(Duration::from_secs(1));
        let mut config = config();
        config.processing.channel_capacity = 5;
        config.processing.batch_queue_capacity = 1;
        config.processing.flush_worker_count = 1;
        let ctx = context(config, Arc::new(sink));
        let cancel = ctx.cancel.clone();
        let worker = PartitionWorker::spawn("partition_06", ctx);

        // slot busy with one batch, one batch queued, one being enqueued, five buffered
        let mut accepted = 0;
        for i in 0..100 {
            let record = Record::new("partition_06", format!("site{i}.com"));
            match tokio::time::timeout(Duration::from_millis(100), worker.send(record)).await {
                Ok(Ok(())) => accepted += 1,
                _ => break,
            }
        }

        assert!(accepted < 100, "producer was never blocked");
        cancel.cancel();
        worker.finish().await;
    }
}
