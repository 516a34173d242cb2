//! Deterministic key -> partition mapping.
//!
//! Every key is hashed with SHA-256 after lower-casing, the first eight bytes of the digest are
//! read as a little endian integer and reduced modulo the partition count. The mapping depends on
//! nothing but the key and the partition count, so it is stable across calls, processes and hosts,
//! and spreads keys uniformly enough that every partition gets a similar share of the write load.
use sha2::{Digest, Sha256};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRouter {
    partition_count: usize,
}

impl PartitionRouter {
    pub fn new(partition_count: usize) -> Result<Self, ConfigError> {
        if partition_count == 0 {
            return Err(ConfigError::PartitionCount);
        }

        Ok(PartitionRouter { partition_count })
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Partition index in `0..partition_count` for `key`.
    pub fn route(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.to_lowercase().as_bytes());

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);

        (u64::from_le_bytes(prefix) % self.partition_count as u64) as usize
    }

    /// Partition key as stored in the backing table, eg `partition_07`.
    pub fn partition_key(&self, key: &str) -> String {
        key_for(self.route(key))
    }

    /// Every partition key, in index order.
    pub fn partition_keys(&self) -> Vec<String> {
        (0..self.partition_count).map(key_for).collect()
    }
}

fn key_for(index: usize) -> String {
    format!("partition_{:02}", index)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::PartitionRouter;

    #[test]
    fn zero_partitions_is_rejected() {
        assert!(PartitionRouter::new(0).is_err());
    }

    #[test]
    fn routes_are_stable_across_processes() {
        // Pinned values: any change here reshuffles every previously imported table.
        let router = PartitionRouter::new(10).unwrap();

        assert_eq!(router.route("example.com"), 9);
        assert_eq!(router.route("google.com"), 0);
        assert_eq!(router.route("bet365.com"), 5);
        assert_eq!(router.route("a.com"), 6);
        assert_eq!(router.partition_key("example.com"), "partition_09");
    }

    #[test]
    fn routing_ignores_case() {
        let router = PartitionRouter::new(16).unwrap();

        assert_eq!(router.route("Example.COM"), router.route("example.com"));
        assert_eq!(router.route("example.com"), 3);
    }

    #[test]
    fn repeated_calls_agree() {
        let router = PartitionRouter::new(10).unwrap();

        for i in 0..1_000 {
            let key = format!("domain-{i}.com");
            assert_eq!(router.route(&key), router.route(&key));
        }
    }

    #[test]
    fn keys_spread_over_every_partition() {
        let router = PartitionRouter::new(10).unwrap();
        let mut counts: HashMap<usize, usize> = HashMap::new();

        for i in 0..10_000 {
            *counts.entry(router.route(&format!("site{i}.net"))).or_default() += 1;
        }

        assert_eq!(counts.len(), 10);
        for count in counts.values() {
            // 1000 expected per partition
            assert!(*count > 800 && *count < 1200, "unbalanced partition: {count}");
        }
    }

    #[test]
    fn partition_keys_cover_every_index() {
        let router = PartitionRouter::new(12).unwrap();
        let keys = router.partition_keys();

        assert_eq!(keys.len(), 12);
        assert_eq!(keys[0], "partition_00");
        assert_eq!(keys[11], "partition_11");
        assert!(keys.contains(&router.partition_key("example.com")));
    }

    #[test]
    fn single_partition_takes_everything() {
        let router = PartitionRouter::new(1).unwrap();

        assert_eq!(router.route("stake.com"), 0);
        assert_eq!(router.partition_key("stake.com"), "partition_00");
    }
}
