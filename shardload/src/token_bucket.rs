//! Token bucket used for both the account-wide and the per-partition throughput ceilings.
//!
//! Two properties matter more than usual here:
//!
//! * A new bucket starts **empty**. A bucket that starts full lets the first second through
//!   `rate + capacity` operations, which is enough to trip a store that enforces its ceiling per
//!   second.
//! * The bucket lock only guards the arithmetic. A consumer that has to wait computes its wait,
//!   drops the lock and sleeps outside of it, then re-checks. Sleeping with the lock held
//!   serialises every flush slot of the partition behind the first waiter.
//!
//! Waiters are served in arrival order. A consumer that cannot be served right away takes a ticket
//! and only the oldest ticket may take refilled tokens, so a stream of small requests cannot keep
//! a large one waiting forever.
use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

// Below this the timer resolution dominates and we would spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    wanted: f64,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
    consumed: u64,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

impl BucketState {
    /// Tokens wanted by `ticket` and every waiter queued ahead of it.
    fn wanted_through(&self, ticket: u64) -> f64 {
        let mut wanted = 0.0;
        for waiter in &self.waiters {
            wanted += waiter.wanted;
            if waiter.ticket == ticket {
                break;
            }
        }
        wanted
    }

    fn take(&mut self, wanted: f64) {
        self.available -= wanted;
        self.consumed += wanted as u64;
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_second: u32,
    capacity: u32,
    state: Mutex<BucketState>,
}

/// Place in line of a waiting consumer, given up when the consumer goes away.
struct Ticket<'a> {
    state: &'a Mutex<BucketState>,
    ticket: Option<u64>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            self.state.lock().waiters.retain(|waiter| waiter.ticket != ticket);
        }
    }
}

impl TokenBucket {
    /// Rate and capacity are clamped to 1: a zero rate would make every wait infinite.
    pub fn new(rate_per_second: u32, capacity: u32) -> Self {
        TokenBucket {
            rate_per_second: rate_per_second.max(1),
            capacity: capacity.max(1),
            state: Mutex::new(BucketState {
                available: 0.0,
                last_refill: Instant::now(),
                consumed: 0,
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Bucket allowing a burst of a tenth of its rate.
    pub fn with_default_burst(rate_per_second: u32) -> Self {
        Self::new(rate_per_second, rate_per_second / 10)
    }

    pub fn rate_per_second(&self) -> u32 {
        self.rate_per_second
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens handed out since creation.
    pub fn consumed(&self) -> u64 {
        self.state.lock().consumed
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available
    }

    /// Consumers currently waiting for tokens.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Wait until `tokens` are available and take them. Returns the time spent waiting.
    ///
    /// Requests above the capacity can never be satisfied in one go, they are taken in
    /// capacity-sized chunks instead. Dropping the returned future gives up its place in line but
    /// does not hand back chunks that were already taken.
    pub async fn consume(&self, tokens: u32) -> Duration {
        let started = Instant::now();
        let mut remaining = tokens;

        while remaining > 0 {
            let chunk = remaining.min(self.capacity);
            self.consume_chunk(chunk as f64).await;
            remaining -= chunk;
        }

        started.elapsed()
    }

    /// Take `tokens` if they are available right now and nobody is waiting for them.
    pub fn try_consume(&self, tokens: u32) -> bool {
        let wanted = tokens as f64;
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.waiters.is_empty() && state.available >= wanted {
            state.take(wanted);
            return true;
        }
        false
    }

    async fn consume_chunk(&self, wanted: f64) {
        let mut ticket = Ticket {
            state: &self.state,
            ticket: None,
        };

        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, Instant::now());

                let first = match (ticket.ticket, state.waiters.front()) {
                    (None, None) => true,
                    (Some(mine), Some(head)) => head.ticket == mine,
                    _ => false,
                };

                if first && state.available >= wanted {
                    state.take(wanted);
                    if ticket.ticket.take().is_some() {
                        state.waiters.pop_front();
                    }
                    return;
                }

                let mine = match ticket.ticket {
                    Some(mine) => mine,
                    None => {
                        let mine = state.next_ticket;
                        state.next_ticket += 1;
                        state.waiters.push_back(Waiter {
                            ticket: mine,
                            wanted,
                        });
                        ticket.ticket = Some(mine);
                        mine
                    }
                };

                let missing = state.wanted_through(mine) - state.available;
                Duration::from_secs_f64(missing.max(0.0) / self.rate_per_second as f64)
            };

            // lock is released at this point
            tokio::time::sleep(wait.max(MIN_WAIT)).await;
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let refilled = state.available + elapsed.as_secs_f64() * self.rate_per_second as f64;
        state.available = refilled.min(self.capacity as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::task::JoinSet;
    use tokio::time::Instant;

    use super::TokenBucket;

    #[tokio::test(start_paused = true)]
    async fn new_bucket_has_no_startup_burst() {
        // rate=100/s, burst=20: the 20 tokens must be earned, not handed out
        let bucket = TokenBucket::new(100, 20);

        let started = Instant::now();
        bucket.consume(20).await;

        assert!(started.elapsed() >= Duration::from_millis(195));
    }

    #[tokio::test(start_paused = true)]
    async fn first_single_token_waits_for_refill() {
        let bucket = TokenBucket::new(100, 20);

        assert!(!bucket.try_consume(1));

        let waited = bucket.consume(1).await;
        assert!(waited >= Duration::from_millis(5), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn available_tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(1_000, 50);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(bucket.available(), 50.0);
        assert!(bucket.try_consume(50));
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_clamped() {
        let bucket = TokenBucket::new(0, 0);

        assert_eq!(bucket.rate_per_second(), 1);
        assert_eq!(bucket.capacity(), 1);

        let waited = bucket.consume(1).await;
        assert!(waited <= Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_above_capacity_are_chunked() {
        // 100 tokens through a 10-token bucket at 100/s is one second of refill
        let bucket = TokenBucket::new(100, 10);

        let waited = bucket.consume(100).await;

        assert!(waited >= Duration::from_millis(990), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1_200), "waited {waited:?}");
        assert_eq!(bucket.consumed(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_consumer_does_not_hold_the_lock() {
        // rate=1000/s, capacity=100. A waits ~100ms for its 100 tokens with the lock released, so
        // the bucket can be inspected meanwhile and B queues up behind A instead of blocking on it.
        let bucket = Arc::new(TokenBucket::new(1_000, 100));

        let large = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.consume(100).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bucket.available() >= 19.0);
        assert_eq!(bucket.waiting(), 1);
        assert!(!bucket.try_consume(1));

        let started = Instant::now();
        bucket.consume(1).await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(80), "waited {waited:?}");
        assert!(waited < Duration::from_millis(120), "waited {waited:?}");

        assert!(large.is_finished());
        large.await.expect("large consumer panicked");
        assert_eq!(bucket.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn large_request_is_not_starved_by_small_ones() {
        let bucket = Arc::new(TokenBucket::new(1_000, 100));

        let mut small = JoinSet::new();
        for _ in 0..3 {
            let bucket = bucket.clone();
            small.spawn(async move {
                loop {
                    bucket.consume(1).await;
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        let large = tokio::time::timeout(Duration::from_secs(60), bucket.consume(100)).await;
        small.abort_all();

        let waited = large.expect("large request starved");
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_gives_up_its_place() {
        let bucket = Arc::new(TokenBucket::new(100, 100));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), bucket.consume(100)).await;
        assert!(abandoned.is_err());
        assert_eq!(bucket.waiting(), 0);

        // the tokens earned while the dropped waiter was queued are still there
        let waited = bucket.consume(5).await;
        assert!(waited < Duration::from_millis(5), "waited {waited:?}");
        assert_eq!(bucket.consumed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_consumers_never_double_spend() {
        let consumers = 20;
        let bucket = Arc::new(TokenBucket::new(1_000, 1));
        let done = Arc::new(AtomicU32::new(0));

        let mut set = JoinSet::new();
        for _ in 0..consumers {
            let bucket = bucket.clone();
            let done = done.clone();
            set.spawn(async move {
                bucket.consume(1).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        while let Some(res) = set.join_next().await {
            res.expect("consumer panicked");
        }

        assert_eq!(done.load(Ordering::SeqCst), consumers);
        assert_eq!(bucket.consumed(), consumers as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_consumers_respect_the_rate() {
        // 5 tokens at 100/s need ~50ms however the consumers interleave
        let bucket = Arc::new(TokenBucket::new(100, 1));

        let started = Instant::now();
        let mut set = JoinSet::new();
        for _ in 0..5 {
            let bucket = bucket.clone();
            set.spawn(async move { bucket.consume(1).await });
        }
        while let Some(res) = set.join_next().await {
            res.expect("consumer panicked");
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn all_waiters_complete_without_deadlock() {
        let bucket = Arc::new(TokenBucket::new(500, 1));

        let mut set = JoinSet::new();
        for _ in 0..10 {
            let bucket = bucket.clone();
            set.spawn(async move { bucket.consume(1).await });
        }

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(res) = set.join_next().await {
                res.expect("consumer panicked");
            }
        })
        .await;

        assert!(drained.is_ok(), "consumers did not finish in time");
    }
}
