use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::record::Batch;

/// Batches of one partition waiting for a flush slot.
///
/// Fresh batches arrive over a bounded channel from the batcher, so a slow partition pushes back
/// on its producer. Failed batches are re-enqueued on a separate deque that is not bounded: at
/// most one batch per flush slot can be in it, and pushing it into the channel could deadlock with
/// the batcher waiting for room.
///
/// The queue is finished once the channel is closed, nothing is left to hand out and no handed
/// out batch is still outstanding (a failed batch can always come back).
pub struct FlushQueue {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Batch>>,
    retries: Mutex<VecDeque<Batch>>,
    pending: Arc<AtomicUsize>,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    changed: Notify,
}

/// Producer side of a [`FlushQueue`].
#[derive(Clone)]
pub struct BatchSender {
    sender: mpsc::Sender<Batch>,
    pending: Arc<AtomicUsize>,
}

impl BatchSender {
    /// Wait for room and enqueue `batch`. Hands the batch back if the queue is gone.
    ///
    /// The room is reserved before the batch moves, so cancelling the wait keeps the batch with the
    /// caller.
    pub async fn send(&self, batch: Batch) -> Result<(), Batch> {
        match self.sender.reserve().await {
            Ok(permit) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                permit.send(batch);
                Ok(())
            }
            Err(_) => Err(batch),
        }
    }

    /// Enqueue `batch` only if there is room right now.
    pub fn try_send(&self, batch: Batch) -> Result<(), TrySendError<Batch>> {
        match self.sender.try_reserve() {
            Ok(permit) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                permit.send(batch);
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(TrySendError::Full(batch)),
            Err(TrySendError::Closed(())) => Err(TrySendError::Closed(batch)),
        }
    }

    /// Fresh batches sent but not yet picked up by a flush slot.
    pub fn queued(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl FlushQueue {
    pub fn new(capacity: usize) -> (BatchSender, FlushQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));

        let queue = FlushQueue {
            receiver: tokio::sync::Mutex::new(receiver),
            retries: Mutex::new(VecDeque::new()),
            pending: pending.clone(),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
        };

        (BatchSender { sender, pending }, queue)
    }

    /// Next batch to write, retries first. `None` once the queue is finished.
    ///
    /// Every batch returned must be handed back through [`retry`](Self::retry) or
    /// [`complete`](Self::complete).
    pub async fn next(&self) -> Option<Batch> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(batch) = self.retries.lock().pop_front() {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return Some(batch);
            }

            if !self.closed.load(Ordering::SeqCst) {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(batch) => {
                            self.pending.fetch_sub(1, Ordering::SeqCst);
                            self.outstanding.fetch_add(1, Ordering::SeqCst);
                            return Some(batch);
                        }
                        None => {
                            self.closed.store(true, Ordering::SeqCst);
                            self.changed.notify_waiters();
                            continue;
                        }
                    },
                    // a retry arrived while we were waiting on the channel
                    _ = &mut changed => continue,
                }
            }

            if self.outstanding.load(Ordering::SeqCst) == 0 && self.retries.lock().is_empty() {
                return None;
            }

            changed.await;
        }
    }

    /// Put a handed out batch back for another attempt.
    pub fn retry(&self, batch: Batch) {
        self.retries.lock().push_back(batch);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Mark a handed out batch as done, written or given up on.
    pub fn complete(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Batches waiting for a flush slot, retries included.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst) + self.retries.lock().len()
    }

    /// Stop accepting batches and take whatever is left. Used on cancellation.
    pub async fn drain(&self) -> Vec<Batch> {
        let mut drained: Vec<Batch> = self.retries.lock().drain(..).collect();

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        while let Ok(batch) = receiver.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            drained.push(batch);
        }
        drop(receiver);

        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        drained
    }
}
