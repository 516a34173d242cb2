use envconfig::Envconfig;

use shardload::config::{
    AdaptiveDegradationConfig, BackoffConfig, PartitionProcessingConfig, ThrottlingConfig,
};
use shardload::ImportConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,
    /// Newline separated list of domains to import.
    pub domains_path: String,

    #[envconfig(default = "20000")]
    pub global_limit_per_second: u32,
    #[envconfig(default = "2000")]
    pub partition_limit_per_second: u32,

    #[envconfig(default = "10")]
    pub partition_count: usize,
    #[envconfig(default = "100")]
    pub batch_size: usize,
    #[envconfig(default = "5")]
    pub flush_worker_count: usize,
    #[envconfig(default = "10000")]
    pub channel_capacity: usize,
    #[envconfig(default = "10")]
    pub batch_queue_capacity: usize,

    #[envconfig(default = "200")]
    pub backoff_base_ms: u64,
    #[envconfig(default = "10000")]
    pub backoff_max_ms: u64,
    #[envconfig(default = "3")]
    pub max_retries: u32,
    #[envconfig(default = "0.2")]
    pub backoff_jitter: f64,

    #[envconfig(default = "true")]
    pub adaptive_degradation_enabled: bool,
    #[envconfig(default = "10")]
    pub degradation_percentage_per_error: u32,
    #[envconfig(default = "80")]
    pub minimum_degradation_percentage: u32,
    #[envconfig(default = "60")]
    pub recovery_interval_secs: u64,
    #[envconfig(default = "300")]
    pub circuit_breaker_reset_interval_secs: u64,
    #[envconfig(default = "1000")]
    pub circuit_poll_interval_ms: u64,

    #[envconfig(default = "5000")]
    pub progress_interval_ms: u64,
}

impl Config {
    pub fn import_config(&self) -> ImportConfig {
        ImportConfig {
            throttling: ThrottlingConfig {
                global_limit_per_second: self.global_limit_per_second,
                partition_limit_per_second: self.partition_limit_per_second,
            },
            processing: PartitionProcessingConfig {
                partition_count: self.partition_count,
                batch_size: self.batch_size,
                flush_worker_count: self.flush_worker_count,
                channel_capacity: self.channel_capacity,
                batch_queue_capacity: self.batch_queue_capacity,
            },
            backoff: BackoffConfig {
                base_ms: self.backoff_base_ms,
                max_ms: self.backoff_max_ms,
                max_retries: self.max_retries,
                jitter: self.backoff_jitter,
            },
            degradation: AdaptiveDegradationConfig {
                enabled: self.adaptive_degradation_enabled,
                degradation_percentage_per_error: self.degradation_percentage_per_error,
                minimum_degradation_percentage: self.minimum_degradation_percentage,
                recovery_interval_secs: self.recovery_interval_secs,
                circuit_breaker_reset_interval_secs: self.circuit_breaker_reset_interval_secs,
                circuit_poll_interval_ms: self.circuit_poll_interval_ms,
            },
            progress_interval_ms: self.progress_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::Config;

    #[test]
    fn defaults_match_the_library() {
        let env = HashMap::from([("DOMAINS_PATH".to_string(), "/tmp/domains.txt".to_string())]);
        let config = Config::init_from_hashmap(&env).expect("valid environment");

        assert_eq!(config.import_config(), shardload::ImportConfig::default());
        assert!(!config.print_sink);
    }

    #[test]
    fn environment_overrides_limits() {
        let env = HashMap::from([
            ("DOMAINS_PATH".to_string(), "/tmp/domains.txt".to_string()),
            ("PARTITION_LIMIT_PER_SECOND".to_string(), "500".to_string()),
            ("ADAPTIVE_DEGRADATION_ENABLED".to_string(), "false".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).expect("valid environment");
        let import = config.import_config();

        assert_eq!(import.throttling.partition_limit_per_second, 500);
        assert!(!import.degradation.enabled);
    }

    #[test]
    fn domains_path_is_required() {
        assert!(Config::init_from_hashmap(&HashMap::new()).is_err());
    }
}
