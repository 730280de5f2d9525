//! Bounded checkpoint cache with least-recently-used eviction
//!
//! Recency is tracked with a per-entry atomic stamp, so `get` only needs the
//! read lock. Eviction scans for the smallest stamp; the cache is small
//! (hundreds of entries) and evictions only happen on `put`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use super::Checkpoint;

struct CacheEntry {
    checkpoint: Checkpoint,
    last_access: AtomicU64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
}

impl CacheInner {
    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }

    fn shrink_to(&mut self, limit: usize) {
        while self.entries.len() > limit {
            if let Some(evicted) = self.evict_lru() {
                debug!(checkpoint_id = %evicted, "Evicted checkpoint from cache");
            }
        }
    }
}

/// In-memory cache of checkpoints keyed by ID. Never the source of truth.
pub struct CheckpointCache {
    inner: RwLock<CacheInner>,
    clock: AtomicU64,
}

impl CheckpointCache {
    /// Create a cache holding at most `max_size` checkpoints; 0 disables caching
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                max_size,
            }),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get a copy of a cached checkpoint
    pub fn get(&self, id: &str) -> Option<Checkpoint> {
        let inner = self.inner.read();
        let entry = inner.entries.get(id)?;
        entry.last_access.store(self.tick(), Ordering::Relaxed);
        Some(entry.checkpoint.clone())
    }

    /// Insert or replace a checkpoint, evicting the least recently used
    /// entry when the cache is full
    pub fn put(&self, checkpoint: Checkpoint) {
        let stamp = self.tick();
        let mut inner = self.inner.write();
        if inner.max_size == 0 {
            return;
        }

        if let Some(entry) = inner.entries.get_mut(&checkpoint.id) {
            entry.checkpoint = checkpoint;
            entry.last_access.store(stamp, Ordering::Relaxed);
            return;
        }

        let limit = inner.max_size - 1;
        inner.shrink_to(limit);
        inner.entries.insert(
            checkpoint.id.clone(),
            CacheEntry {
                checkpoint,
                last_access: AtomicU64::new(stamp),
            },
        );
    }

    /// Replace the cached copy of a checkpoint if one is present.
    /// Does not insert and does not count as an access.
    pub fn refresh(&self, checkpoint: &Checkpoint) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(&checkpoint.id) {
            entry.checkpoint = checkpoint.clone();
        }
    }

    /// Drop one checkpoint from the cache
    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().entries.remove(id).is_some()
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    /// Number of cached checkpoints
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity
    pub fn max_size(&self) -> usize {
        self.inner.read().max_size
    }

    /// Change the capacity, evicting immediately if the cache is now over it
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.inner.write();
        inner.max_size = max_size;
        inner.shrink_to(max_size);
    }
}
