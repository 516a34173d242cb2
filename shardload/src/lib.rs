pub mod api;
pub mod backoff;
pub mod config;
pub mod degradation;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod record;
pub mod router;
pub mod sink;
pub mod stats;
pub mod throttler;
pub mod time;
pub mod token_bucket;
pub mod worker;

pub use api::{ImportError, ImportStatus, ImportSummary, WriteError};
pub use config::{ConfigError, ImportConfig};
pub use processor::ShardingProcessor;
pub use record::{Batch, Record};
pub use router::PartitionRouter;
