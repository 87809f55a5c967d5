use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    error::{CacheError, CacheResult},
    traits::Cache,
};
use crate::config::MemoryCacheConfig;

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn new(data: Vec<u8>, expires_at: Option<Instant>) -> Self {
        Self {
            data,
            expires_at,
            last_accessed: Instant::now(),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }
}

/// What a full cache may drop to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    /// Expired entries, then the least recently used ones.
    Lru,
    /// Expired entries only. Writes fail while every entry is still live.
    ExpiredOnly,
}

/// In-memory cache implementation using DashMap for concurrent access.
///
/// Each process keeps its own map. Behind a load balancer with several
/// replicas, replay detection is therefore per replica.
pub struct MemoryCache {
    data: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
    eviction_batch_size: usize,
    eviction: Eviction,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            max_entries: config.max_entries,
            eviction_batch_size: config.eviction_batch_size.max(1),
            eviction: Eviction::Lru,
        }
    }

    /// Store for consumed assertion IDs. A live entry is never evicted, so
    /// filling the store cannot make an assertion replayable; once it is
    /// full of live entries, writes fail instead.
    pub fn replay_store(max_entries: usize) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            max_entries,
            eviction_batch_size: 1,
            eviction: Eviction::ExpiredOnly,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn evict_if_needed(&self) -> CacheResult<()> {
        if self.data.len() < self.max_entries {
            return Ok(());
        }

        // First pass: remove all expired entries
        self.data.retain(|_, entry| !entry.is_expired());

        let current_len = self.data.len();
        if current_len < self.max_entries {
            return Ok(());
        }

        if self.eviction == Eviction::ExpiredOnly {
            return Err(CacheError::CapacityExceeded(self.max_entries));
        }

        let target_size = self.max_entries.saturating_sub(self.eviction_batch_size);
        let to_evict = current_len.saturating_sub(target_size);

        if to_evict == 0 {
            return Ok(());
        }

        // Oldest access first
        let mut entries: Vec<_> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed))
            .collect();
        entries.sort_by_key(|(_, last_accessed)| *last_accessed);

        for (key, _) in entries.into_iter().take(to_evict) {
            self.data.remove(&key);
        }
        Ok(())
    }

    fn expiry(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove_if(key, |_, entry| entry.is_expired());
                return Ok(None);
            }

            entry.touch();
            Ok(Some(entry.data.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        if !self.data.contains_key(key) {
            self.evict_if_needed()?;
        }

        self.data.insert(
            key.to_string(),
            CacheEntry::new(value.to_vec(), Self::expiry(ttl)),
        );

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        if let Some(entry) = self.data.get(key)
            && !entry.is_expired()
        {
            return Ok(false);
        }

        self.evict_if_needed()?;

        // Entry API holds the shard lock, so check-and-insert is atomic
        use dashmap::mapref::entry::Entry;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(CacheEntry::new(value.to_vec(), Self::expiry(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(e) => {
                e.insert(CacheEntry::new(value.to_vec(), Self::expiry(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.remove(key);
        Ok(())
    }
}
