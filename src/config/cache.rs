use serde::{Deserialize, Serialize};

use super::ConfigError;

/// In-memory cache configuration.
///
/// Role mapping results go to an LRU cache bounded by `max_entries`.
/// Consumed assertion IDs go to a separate store that never evicts a live
/// entry and rejects logins while it is full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries in the cache.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Number of entries to evict when cache is full.
    /// Eviction removes expired entries first, then uses LRU.
    #[serde(default = "default_eviction_batch_size")]
    pub eviction_batch_size: usize,

    /// TTL for cached role mapping results in seconds. 0 keeps them until evicted.
    #[serde(default = "default_role_mapping_ttl")]
    pub role_mapping_ttl_secs: u64,

    /// Maximum number of unexpired assertion IDs remembered for replay
    /// detection.
    #[serde(default = "default_replay_max_entries")]
    pub replay_max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            eviction_batch_size: default_eviction_batch_size(),
            role_mapping_ttl_secs: default_role_mapping_ttl(),
            replay_max_entries: default_replay_max_entries(),
        }
    }
}

impl MemoryCacheConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be greater than 0".into(),
            ));
        }
        if self.replay_max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.replay_max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_eviction_batch_size() -> usize {
    100
}

fn default_role_mapping_ttl() -> u64 {
    3600
}

fn default_replay_max_entries() -> usize {
    100_000
}
