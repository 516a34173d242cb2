use serde::{Deserialize, Serialize};

use crate::router::PartitionRouter;

/// One unit of work: a key (usually a domain name) and the partition it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Record {
    pub partition_key: String,
    pub key: String,
}

impl Record {
    pub fn new(partition_key: impl Into<String>, key: impl Into<String>) -> Self {
        Record {
            partition_key: partition_key.into(),
            key: key.into(),
        }
    }

    /// Build a record whose partition is picked by `router`.
    pub fn routed(key: impl Into<String>, router: &PartitionRouter) -> Self {
        let key = key.into();
        Record {
            partition_key: router.partition_key(&key),
            key,
        }
    }
}

/// Records of a single partition written to the store in one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub partition_key: String,
    pub records: Vec<Record>,
    /// Number of failed write attempts so far.
    pub attempt: u32,
}

impl Batch {
    pub fn new(partition_key: impl Into<String>, records: Vec<Record>) -> Self {
        Batch {
            partition_key: partition_key.into(),
            records,
            attempt: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key.clone()).collect()
    }
}
