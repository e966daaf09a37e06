//! Bounded row cache with optional TTL
//!
//! Sits in front of a table's shards. Only hits are cached; a miss always
//! goes to the shard so newly published keys are never hidden.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

struct CachedRow {
    row: Arc<[u8]>,
    expires_at: Option<Instant>,
}

pub struct RowCache {
    entries: Mutex<LruCache<Vec<u8>, CachedRow>>,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("capacity", &self.capacity())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RowCache {
    /// Returns `None` for a zero capacity, meaning "no cache"
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: ttl.filter(|t| !t.is_zero()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at.is_some_and(|t| t <= Instant::now()),
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| Arc::clone(&entry.row))
    }

    pub fn insert(&self, key: &[u8], row: Arc<[u8]>) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .put(key.to_vec(), CachedRow { row, expires_at });
    }
}
