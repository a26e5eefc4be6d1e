//! Secondary cache tier for raw block bytes.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// A slower, possibly persistent cache consulted before the table file.
///
/// Entries are raw blocks exactly as stored in the file, trailer included, so
/// checksums are still verified on a hit.
pub trait PersistentCache: Send + Sync {
    /// Stores `data` under `key`.
    fn insert(&self, key: &[u8], data: &[u8]) -> Result<()>;

    /// Returns the bytes stored under `key`, if any.
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns a fresh id for building cache key prefixes.
    fn new_id(&self) -> u64;
}

#[derive(Debug, Default)]
struct MemoryInner {
    map: HashMap<Vec<u8>, Vec<u8>>,
    order: VecDeque<Vec<u8>>,
    size: usize,
}

/// Bounded in-memory [`PersistentCache`] with FIFO eviction.
#[derive(Debug)]
pub struct MemoryPersistentCache {
    capacity: usize,
    inner: Mutex<MemoryInner>,
    last_id: AtomicU64,
}

impl MemoryPersistentCache {
    /// Create a cache holding up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(MemoryInner::default()), last_id: AtomicU64::new(0) }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentCache for MemoryPersistentCache {
    fn insert(&self, key: &[u8], data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.remove(key) {
            inner.size -= old.len();
            inner.order.retain(|k| k != key);
        }
        while inner.size + data.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some(old) = inner.map.remove(&oldest) {
                inner.size -= old.len();
            }
        }
        inner.size += data.len();
        inner.order.push_back(key.to_vec());
        inner.map.insert(key.to_vec(), data.to_vec());
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().map.get(key).cloned())
    }

    fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup() {
        let cache = MemoryPersistentCache::new(100);
        cache.insert(b"a", b"block-a").unwrap();
        assert_eq!(cache.lookup(b"a").unwrap().as_deref(), Some(&b"block-a"[..]));
        assert!(cache.lookup(b"b").unwrap().is_none());
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = MemoryPersistentCache::new(10);
        cache.insert(b"a", &[0u8; 4]).unwrap();
        cache.insert(b"b", &[0u8; 4]).unwrap();
        cache.insert(b"c", &[0u8; 4]).unwrap();
        assert!(cache.lookup(b"a").unwrap().is_none());
        assert_eq!(cache.len(), 2);

        // Larger than the whole cache: ignored.
        cache.insert(b"d", &[0u8; 11]).unwrap();
        assert!(cache.lookup(b"d").unwrap().is_none());
    }
}
