//! Per-partition adaptive degradation and circuit breaker.
//!
//! ```text
//! Closed --error--> Degraded --error at floor--> Open
//!    ^                 |  ^                        |
//!    +--recovered------+  +----reset interval------+
//! ```
//!
//! The state is plain data: callers hold it behind a lock and pass the original limit, the
//! configuration and the current instant, and get back the [`DegradationEvent`] that happened so
//! they can log and count it outside the lock.
use serde::Serialize;
use tokio::time::Instant;

use crate::config::AdaptiveDegradationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Degraded,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Degraded,
    Open { since: Instant },
}

/// What a call on [`PartitionDegradationState`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationEvent {
    /// The call had no effect because the circuit is open.
    Ignored,
    /// Nothing to do, eg a success at full limit or before the recovery interval.
    Unchanged,
    Degraded { from: u32, to: u32 },
    /// The limit reached the floor and the circuit opened.
    Opened { from: u32, to: u32 },
    /// The reset interval elapsed; traffic resumes at the floor.
    HalfOpened { limit: u32 },
    Recovered { from: u32, to: u32 },
    /// Back at the original limit.
    Closed { from: u32, to: u32 },
}

#[derive(Debug)]
pub struct PartitionDegradationState {
    /// `None` until the first error: the original limit applies.
    effective_limit: Option<u32>,
    circuit: Circuit,
    last_error: Option<Instant>,
    last_recovery: Option<Instant>,
}

impl Default for PartitionDegradationState {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionDegradationState {
    pub fn new() -> Self {
        PartitionDegradationState {
            effective_limit: None,
            circuit: Circuit::Closed,
            last_error: None,
            last_recovery: None,
        }
    }

    /// Limit currently in force, always within `1..=original`.
    pub fn effective_limit(&self, original: u32) -> u32 {
        let original = original.max(1);
        self.effective_limit.unwrap_or(original).clamp(1, original)
    }

    pub fn circuit_state(&self) -> CircuitState {
        match self.circuit {
            Circuit::Closed => CircuitState::Closed,
            Circuit::Degraded => CircuitState::Degraded,
            Circuit::Open { .. } => CircuitState::Open,
        }
    }

    pub fn opened_at(&self) -> Option<Instant> {
        match self.circuit {
            Circuit::Open { since } => Some(since),
            _ => None,
        }
    }

    /// Effective limit as a percentage of the original.
    pub fn limit_percent(&self, original: u32) -> u32 {
        let original = original.max(1);
        (self.effective_limit(original) as u64 * 100 / original as u64) as u32
    }

    pub fn record_error(
        &mut self,
        original: u32,
        config: &AdaptiveDegradationConfig,
        now: Instant,
    ) -> DegradationEvent {
        let original = original.max(1);
        self.last_error = Some(now);

        if let Circuit::Open { .. } = self.circuit {
            // Past the reset interval an error only half-opens the circuit, it does not degrade
            // any further in the same call.
            return self
                .reset_if_elapsed(original, config, now)
                .unwrap_or(DegradationEvent::Ignored);
        }

        let floor = floor(original, config);
        let step = percent_of(original, config.degradation_percentage_per_error);
        let from = self.effective_limit(original);
        let to = from.saturating_sub(step).max(floor);

        self.effective_limit = Some(to);
        if to <= floor {
            self.circuit = Circuit::Open { since: now };
            DegradationEvent::Opened { from, to }
        } else {
            self.circuit = Circuit::Degraded;
            DegradationEvent::Degraded { from, to }
        }
    }

    pub fn record_success(
        &mut self,
        original: u32,
        config: &AdaptiveDegradationConfig,
        now: Instant,
    ) -> DegradationEvent {
        let original = original.max(1);

        if let Circuit::Open { .. } = self.circuit {
            return DegradationEvent::Ignored;
        }

        let from = self.effective_limit(original);
        if from >= original {
            // a half-open circuit whose floor is the original limit has nothing left to recover
            if self.circuit == Circuit::Degraded {
                self.circuit = Circuit::Closed;
                self.last_recovery = Some(now);
                return DegradationEvent::Closed { from, to: from };
            }
            return DegradationEvent::Unchanged;
        }

        let reference = match (self.last_error, self.last_recovery) {
            (Some(error), Some(recovery)) => Some(error.max(recovery)),
            (error, recovery) => error.or(recovery),
        };
        if let Some(reference) = reference {
            if now.saturating_duration_since(reference) < config.recovery_interval() {
                return DegradationEvent::Unchanged;
            }
        }

        let to = from.saturating_add(percent_of(original, 10)).min(original);
        self.effective_limit = Some(to);
        self.last_recovery = Some(now);

        if to >= original {
            self.circuit = Circuit::Closed;
            DegradationEvent::Closed { from, to }
        } else {
            self.circuit = Circuit::Degraded;
            DegradationEvent::Recovered { from, to }
        }
    }

    /// Move an open circuit to half-open once the reset interval has elapsed.
    ///
    /// Returns [`DegradationEvent::Unchanged`] when the circuit is not open or the interval has not
    /// elapsed yet.
    pub fn try_half_open(
        &mut self,
        original: u32,
        config: &AdaptiveDegradationConfig,
        now: Instant,
    ) -> DegradationEvent {
        self.reset_if_elapsed(original.max(1), config, now)
            .unwrap_or(DegradationEvent::Unchanged)
    }

    fn reset_if_elapsed(
        &mut self,
        original: u32,
        config: &AdaptiveDegradationConfig,
        now: Instant,
    ) -> Option<DegradationEvent> {
        let since = self.opened_at()?;
        if now.saturating_duration_since(since) < config.reset_interval() {
            return None;
        }

        let limit = floor(original, config);
        self.effective_limit = Some(limit);
        self.circuit = Circuit::Degraded;
        self.last_recovery = Some(now);

        Some(DegradationEvent::HalfOpened { limit })
    }
}

fn percent_of(original: u32, percent: u32) -> u32 {
    ((original as u64 * percent as u64) / 100).max(1) as u32
}

fn floor(original: u32, config: &AdaptiveDegradationConfig) -> u32 {
    percent_of(original, config.minimum_degradation_percentage).min(original)
}
