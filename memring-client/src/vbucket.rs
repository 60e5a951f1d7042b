// vbucket.rs - Static key partition map
//
// Keys hash to one of a power-of-two number of vbuckets; each vbucket names a
// master server and an ordered list of replicas. The map arrives from config
// or from a topology push and is never mutated once built.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hash::vbucket_hash;

/// Owners of one vbucket. Indices point into `VBucketMap::servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketEntry {
    pub master: usize,
    #[serde(default)]
    pub replicas: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VBucketMap {
    pub servers: Vec<String>,
    pub buckets: Vec<VBucketEntry>,
}

impl VBucketMap {
    /// Checks shape and that every map server is one of `endpoints`.
    pub fn validate<S: AsRef<str>>(&self, endpoints: &[S]) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidVBucketMap(reason));
        let count = self.buckets.len();
        if count == 0 || !count.is_power_of_two() {
            return invalid(format!("bucket count {} is not a power of two", count));
        }
        if count > 0x8000 {
            return invalid(format!("bucket count {} exceeds 32768", count));
        }
        for (id, entry) in self.buckets.iter().enumerate() {
            let out_of_range = std::iter::once(&entry.master)
                .chain(entry.replicas.iter())
                .any(|&index| index >= self.servers.len());
            if out_of_range {
                return invalid(format!("bucket {} names an unknown server", id));
            }
        }
        for server in &self.servers {
            if !endpoints.iter().any(|e| e.as_ref() == server) {
                return invalid(format!("server {} is not configured", server));
            }
        }
        Ok(())
    }

    /// Vbucket id for `key`.
    pub fn bucket_of(&self, key: &[u8]) -> u16 {
        let mask = self.buckets.len().saturating_sub(1) as u32;
        (vbucket_hash(key) & mask) as u16
    }

    pub fn entry(&self, bucket: u16) -> Option<&VBucketEntry> {
        self.buckets.get(bucket as usize)
    }

    /// Master first, then replicas in order.
    pub fn candidates(&self, bucket: u16) -> impl Iterator<Item = &str> + '_ {
        self.entry(bucket)
            .into_iter()
            .flat_map(|entry| std::iter::once(&entry.master).chain(entry.replicas.iter()))
            .filter_map(move |&index| self.servers.get(index).map(String::as_str))
    }
}
