//! Block cache interfaces and the default LRU implementation.
//!
//! Tables consume caches only through the [`Cache`] and [`PersistentCache`]
//! traits. A handle returned by [`Cache::insert`] or [`Cache::lookup`] pins
//! its entry until it is passed back to [`Cache::release`]; [`CachableEntry`]
//! does that automatically when dropped.

mod lru;
mod persistent;

pub use lru::{CacheStats, LruCache};
pub use persistent::{MemoryPersistentCache, PersistentCache};

use crate::error::Result;
use crate::filter::FilterBlockReader;
use crate::sstable::block::Block;
use crate::sstable::format::BlockContents;
use crate::sstable::index_reader::IndexReader;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Eviction priority. Low priority entries are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Evicted only after every low priority entry is gone.
    High,
    /// Default priority.
    Low,
}

/// Values stored in a block cache.
#[derive(Clone)]
pub enum CacheValue {
    /// Parsed, uncompressed block.
    Block(Block),
    /// Raw block bytes as stored in the file, still compressed.
    Compressed(BlockContents),
    /// Filter block reader.
    Filter(Arc<FilterBlockReader>),
    /// Index reader.
    Index(Arc<IndexReader>),
}

impl fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Block(b) => write!(f, "Block({} bytes)", b.size()),
            CacheValue::Compressed(c) => write!(f, "Compressed({} bytes)", c.data.len()),
            CacheValue::Filter(_) => write!(f, "Filter"),
            CacheValue::Index(_) => write!(f, "Index"),
        }
    }
}

/// A pinned cache entry. Must be given back through [`Cache::release`]
/// exactly once; the handle is consumed there, so it cannot be released
/// twice.
#[derive(Debug)]
pub struct CacheHandle {
    slot: usize,
    generation: u64,
    value: CacheValue,
}

impl CacheHandle {
    /// Create a handle for slot `slot` at `generation`.
    pub fn new(slot: usize, generation: u64, value: CacheValue) -> Self {
        Self { slot, generation, value }
    }

    /// The cached value.
    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    /// Slot index in the owning cache.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A shared, reference-counted cache of table blocks.
pub trait Cache: Send + Sync {
    /// Inserts `value` under `key`, replacing any existing entry, and returns
    /// a pinned handle to the new entry.
    ///
    /// Fails with [`Error::MemoryLimit`](crate::Error::MemoryLimit) when no
    /// slot can be found for the entry.
    fn insert(&self, key: &[u8], value: CacheValue, charge: usize, priority: Priority) -> Result<CacheHandle>;

    /// Looks up `key`, pinning the entry on a hit.
    fn lookup(&self, key: &[u8]) -> Option<CacheHandle>;

    /// Unpins an entry.
    fn release(&self, handle: CacheHandle);

    /// Removes `key`. Pinned entries stay alive until released.
    fn erase(&self, key: &[u8]);

    /// Returns a fresh id for building cache key prefixes.
    fn new_id(&self) -> u64;

    /// Total charge of the entries currently held.
    fn usage(&self) -> usize;

    /// Configured capacity.
    fn capacity(&self) -> usize;

    /// Counter snapshot.
    fn stats(&self) -> CacheStats;
}

/// A value that is either owned outright or borrowed from a cache.
///
/// The cached form releases its handle when dropped, so the entry stays
/// pinned in the cache exactly as long as this value is alive.
pub struct CachableEntry<T> {
    value: T,
    handle: Option<(Arc<dyn Cache>, CacheHandle)>,
}

impl<T> CachableEntry<T> {
    /// A value that owns its memory.
    pub fn owned(value: T) -> Self {
        Self { value, handle: None }
    }

    /// A value backed by a pinned cache entry.
    pub fn cached(value: T, cache: Arc<dyn Cache>, handle: CacheHandle) -> Self {
        Self { value, handle: Some((cache, handle)) }
    }

    /// The value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Whether the value is pinned in a cache.
    pub fn is_cached(&self) -> bool {
        self.handle.is_some()
    }
}

impl<T> Deref for CachableEntry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for CachableEntry<T> {
    fn drop(&mut self) {
        if let Some((cache, handle)) = self.handle.take() {
            cache.release(handle);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CachableEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachableEntry")
            .field("value", &self.value)
            .field("cached", &self.is_cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn block_value(n: usize) -> CacheValue {
        CacheValue::Compressed(BlockContents::new(
            Bytes::from(vec![7u8; n]),
            crate::config::CompressionType::None,
        ))
    }

    #[test]
    fn test_cachable_entry_releases_on_drop() {
        let cache: Arc<dyn Cache> = Arc::new(LruCache::new(1024));
        let handle = cache.insert(b"k", block_value(10), 10, Priority::Low).unwrap();
        assert_eq!(cache.usage(), 10);

        let entry = CachableEntry::cached(1u32, cache.clone(), handle);
        assert!(entry.is_cached());
        assert_eq!(*entry, 1);

        // Pinned entries survive erase until the guard is dropped.
        cache.erase(b"k");
        assert_eq!(cache.usage(), 10);
        drop(entry);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_cachable_entry_owned() {
        let entry = CachableEntry::owned(String::from("index"));
        assert!(!entry.is_cached());
        assert_eq!(entry.value(), "index");
    }
}
