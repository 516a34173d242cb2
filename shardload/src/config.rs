use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("partition count must be at least 1")]
    PartitionCount,
    #[error("global limit per second must be at least 1")]
    GlobalLimit,
    #[error("partition limit per second must be at least 1")]
    PartitionLimit,
    #[error("batch size must be at least 1")]
    BatchSize,
    #[error("flush worker count must be at least 1")]
    FlushWorkerCount,
    #[error("channel capacity must be at least 1")]
    ChannelCapacity,
    #[error("batch queue capacity must be at least 1")]
    BatchQueueCapacity,
    #[error("backoff base must be at least 1ms and not above backoff max ({base_ms}ms > {max_ms}ms)")]
    Backoff { base_ms: u64, max_ms: u64 },
    #[error("backoff jitter must be within [0, 1], got {0}")]
    BackoffJitter(f64),
    #[error("degradation percentage per error must be within 1..=100, got {0}")]
    DegradationPercentage(u32),
    #[error("minimum degradation percentage must be within 1..=100, got {0}")]
    MinimumDegradationPercentage(u32),
    #[error("minimum degradation percentage {minimum} leaves no room for a {per_error}% step")]
    NoRoomForDegradation { minimum: u32, per_error: u32 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Account and partition throughput ceilings of the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub global_limit_per_second: u32,
    pub partition_limit_per_second: u32,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        ThrottlingConfig {
            global_limit_per_second: 20_000,
            partition_limit_per_second: 2_000,
        }
    }
}

impl ThrottlingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_limit_per_second == 0 {
            return Err(ConfigError::GlobalLimit);
        }
        if self.partition_limit_per_second == 0 {
            return Err(ConfigError::PartitionLimit);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PartitionProcessingConfig {
    pub partition_count: usize,
    /// Records per storage write, bounded by the store's atomic batch size.
    pub batch_size: usize,
    /// Concurrent flush slots per partition.
    pub flush_worker_count: usize,
    /// Records buffered per partition before the producer blocks.
    pub channel_capacity: usize,
    /// Ready batches buffered per partition before the batcher blocks.
    pub batch_queue_capacity: usize,
}

impl Default for PartitionProcessingConfig {
    fn default() -> Self {
        PartitionProcessingConfig {
            partition_count: 10,
            batch_size: 100,
            flush_worker_count: 5,
            channel_capacity: 10_000,
            batch_queue_capacity: 10,
        }
    }
}

impl PartitionProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_count == 0 {
            return Err(ConfigError::PartitionCount);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        if self.flush_worker_count == 0 {
            return Err(ConfigError::FlushWorkerCount);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ChannelCapacity);
        }
        if self.batch_queue_capacity == 0 {
            return Err(ConfigError::BatchQueueCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Attempts after the first failure before a batch is dropped.
    pub max_retries: u32,
    /// Fraction of the delay randomly added or removed.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_ms: 200,
            max_ms: 10_000,
            max_retries: 3,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 || self.max_ms < self.base_ms {
            return Err(ConfigError::Backoff {
                base_ms: self.base_ms,
                max_ms: self.max_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::BackoffJitter(self.jitter));
        }
        Ok(())
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Progressive degradation with a circuit breaker, per partition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdaptiveDegradationConfig {
    pub enabled: bool,
    pub degradation_percentage_per_error: u32,
    pub minimum_degradation_percentage: u32,
    pub recovery_interval_secs: u64,
    pub circuit_breaker_reset_interval_secs: u64,
    /// How often a flush slot re-checks an open circuit.
    pub circuit_poll_interval_ms: u64,
}

impl Default for AdaptiveDegradationConfig {
    fn default() -> Self {
        AdaptiveDegradationConfig {
            enabled: true,
            degradation_percentage_per_error: 10,
            minimum_degradation_percentage: 80,
            recovery_interval_secs: 60,
            circuit_breaker_reset_interval_secs: 300,
            circuit_poll_interval_ms: 1_000,
        }
    }
}

impl AdaptiveDegradationConfig {
    pub fn disabled() -> Self {
        AdaptiveDegradationConfig {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let per_error = self.degradation_percentage_per_error;
        let minimum = self.minimum_degradation_percentage;

        if per_error == 0 || per_error > 100 {
            return Err(ConfigError::DegradationPercentage(per_error));
        }
        if minimum == 0 || minimum > 100 {
            return Err(ConfigError::MinimumDegradationPercentage(minimum));
        }
        if minimum > 100 - per_error {
            return Err(ConfigError::NoRoomForDegradation { minimum, per_error });
        }
        if self.recovery_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("recovery interval"));
        }
        if self.circuit_breaker_reset_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("circuit breaker reset interval"));
        }
        if self.circuit_poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("circuit poll interval"));
        }
        Ok(())
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.circuit_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImportConfig {
    pub throttling: ThrottlingConfig,
    pub processing: PartitionProcessingConfig,
    pub backoff: BackoffConfig,
    pub degradation: AdaptiveDegradationConfig,
    pub progress_interval_ms: u64,
}

impl ImportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.throttling.validate()?;
        self.processing.validate()?;
        self.backoff.validate()?;
        self.degradation.validate()?;

        if self.progress_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("progress interval"));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            throttling: ThrottlingConfig::default(),
            processing: PartitionProcessingConfig::default(),
            backoff: BackoffConfig::default(),
            degradation: AdaptiveDegradationConfig::default(),
            progress_interval_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ImportConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_batch_size_fails_fast() {
        let mut config = ImportConfig::default();
        config.processing.batch_size = 0;

        assert_eq!(config.validate(), Err(ConfigError::BatchSize));
    }

    #[test]
    fn contradictory_degradation_percentages_are_rejected() {
        let config = AdaptiveDegradationConfig {
            degradation_percentage_per_error: 30,
            minimum_degradation_percentage: 80,
            ..Default::default()
        };

        assert_eq!(
            config.validate(),
            Err(ConfigError::NoRoomForDegradation {
                minimum: 80,
                per_error: 30
            })
        );
    }

    #[test]
    fn backoff_max_below_base_is_rejected() {
        let config = BackoffConfig {
            base_ms: 500,
            max_ms: 100,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_out_of_range_is_rejected() {
        let config = BackoffConfig {
            jitter: 1.5,
            ..Default::default()
        };

        assert_eq!(config.validate(), Err(ConfigError::BackoffJitter(1.5)));
    }

    #[test]
    fn zero_progress_interval_is_rejected() {
        let config = ImportConfig {
            progress_interval_ms: 0,
            ..Default::default()
        };

        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("progress interval"))
        );
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: ImportConfig =
            serde_json::from_str(r#"{"throttling": {"partition_limit_per_second": 500}}"#)
                .expect("valid config json");

        assert_eq!(config.throttling.partition_limit_per_second, 500);
        assert_eq!(config.throttling.global_limit_per_second, 20_000);
        assert_eq!(config.processing.batch_size, 100);
    }
}
