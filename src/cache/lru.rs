//! LRU (Least Recently Used) block cache.
//!
//! Entries live in a fixed-size slot arena addressed by index and generation.
//! An entry is in exactly one of three places: pinned by one or more handles,
//! on one of the two priority LRU lists, or on the free list. Only unpinned
//! entries can be evicted, so capacity is a soft limit: inserts succeed even
//! when every resident entry is pinned.

use crate::cache::{Cache, CacheHandle, CacheValue, Priority};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of slots when none is given.
const DEFAULT_MAX_ENTRIES: usize = 1 << 20;

const NIL: usize = usize::MAX;

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
    /// Number of evictions
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

#[derive(Debug)]
struct Slot {
    key: Vec<u8>,
    value: Option<CacheValue>,
    charge: usize,
    priority: Priority,
    refs: u32,
    /// Still reachable through the hash table.
    in_cache: bool,
    in_lru: bool,
    generation: u64,
    prev: usize,
    next: usize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key: Vec::new(),
            value: None,
            charge: 0,
            priority: Priority::Low,
            refs: 0,
            in_cache: false,
            in_lru: false,
            generation: 0,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Doubly linked list threaded through the slot arena. Oldest at `head`.
#[derive(Debug, Clone, Copy)]
struct LruList {
    head: usize,
    tail: usize,
}

impl LruList {
    const EMPTY: LruList = LruList { head: NIL, tail: NIL };
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    table: HashMap<Vec<u8>, usize>,
    /// Index 0: high priority, index 1: low priority.
    lru: [LruList; 2],
    usage: usize,
    next_generation: u64,
    stats: CacheStats,
}

fn list_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Low => 1,
    }
}

impl Inner {
    fn lru_push_back(&mut self, idx: usize) {
        let list = list_index(self.slots[idx].priority);
        let tail = self.lru[list].tail;
        {
            let slot = &mut self.slots[idx];
            slot.prev = tail;
            slot.next = NIL;
            slot.in_lru = true;
        }
        if tail == NIL {
            self.lru[list].head = idx;
        } else {
            self.slots[tail].next = idx;
        }
        self.lru[list].tail = idx;
    }

    fn lru_remove(&mut self, idx: usize) {
        let list = list_index(self.slots[idx].priority);
        let (prev, next) = {
            let slot = &mut self.slots[idx];
            if !slot.in_lru {
                return;
            }
            slot.in_lru = false;
            (std::mem::replace(&mut slot.prev, NIL), std::mem::replace(&mut slot.next, NIL))
        };
        if prev == NIL {
            self.lru[list].head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.lru[list].tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
    }

    /// Returns the slot to the free list and drops its value.
    fn free_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        debug_assert!(slot.refs == 0 && !slot.in_lru);
        self.usage -= slot.charge;
        slot.value = None;
        slot.key = Vec::new();
        slot.charge = 0;
        slot.in_cache = false;
        self.free.push(idx);
    }

    /// Evicts the oldest unpinned entry, low priority first.
    fn evict_oldest(&mut self) -> bool {
        let victim = [self.lru[1].head, self.lru[0].head].into_iter().find(|&i| i != NIL);
        let Some(idx) = victim else {
            return false;
        };
        self.lru_remove(idx);
        let key = std::mem::take(&mut self.slots[idx].key);
        self.table.remove(&key);
        self.free_slot(idx);
        self.stats.evictions += 1;
        true
    }

    fn evict_to_capacity(&mut self, capacity: usize) {
        while self.usage > capacity && self.evict_oldest() {}
    }

    /// Pops a free slot, growing the arena up to `max_entries`. When the arena
    /// is full, evicts the oldest unpinned entry and tries once more.
    fn allocate_slot(&mut self, max_entries: usize) -> Option<usize> {
        for attempt in 0..2 {
            if let Some(idx) = self.free.pop() {
                return Some(idx);
            }
            if self.slots.len() < max_entries {
                self.slots.push(Slot::empty());
                return Some(self.slots.len() - 1);
            }
            if attempt == 0 && !self.evict_oldest() {
                break;
            }
        }
        None
    }

    /// Drops the hash table's reference to `idx`.
    fn detach(&mut self, idx: usize) {
        self.slots[idx].in_cache = false;
        if self.slots[idx].refs == 0 {
            self.lru_remove(idx);
            self.free_slot(idx);
        }
    }
}

/// Thread-safe LRU cache with two priority pools and pinning handles.
///
/// # Thread Safety
///
/// This cache is thread-safe and can be shared across multiple threads
/// using `Arc<LruCache>`.
#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    max_entries: usize,
    inner: Mutex<Inner>,
    last_id: AtomicU64,
}

impl LruCache {
    /// Create a cache holding up to `capacity` bytes of charge.
    ///
    /// # Examples
    ///
    /// ```
    /// use blocktable::cache::{Cache, LruCache};
    ///
    /// // Create a 8MB cache
    /// let cache = LruCache::new(8 * 1024 * 1024);
    /// assert_eq!(cache.capacity(), 8 * 1024 * 1024);
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self::with_max_entries(capacity, DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache with at most `max_entries` slots.
    pub fn with_max_entries(capacity: usize, max_entries: usize) -> Self {
        Self {
            capacity,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                table: HashMap::new(),
                lru: [LruList::EMPTY; 2],
                usage: 0,
                next_generation: 1,
                stats: CacheStats::default(),
            }),
            last_id: AtomicU64::new(0),
        }
    }

    /// Number of entries reachable by key.
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total charge of pinned entries.
    pub fn pinned_usage(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| s.refs > 0).map(|s| s.charge).sum()
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }
}

impl Cache for LruCache {
    fn insert(&self, key: &[u8], value: CacheValue, charge: usize, priority: Priority) -> Result<CacheHandle> {
        let mut inner = self.inner.lock();

        let Some(idx) = inner.allocate_slot(self.max_entries) else {
            log::warn!("Block cache has no free slot for a {} byte entry", charge);
            return Err(Error::memory_limit("block cache slots exhausted"));
        };

        if let Some(old) = inner.table.remove(key) {
            inner.detach(old);
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        {
            let slot = &mut inner.slots[idx];
            slot.key = key.to_vec();
            slot.value = Some(value.clone());
            slot.charge = charge;
            slot.priority = priority;
            slot.refs = 1;
            slot.in_cache = true;
            slot.in_lru = false;
            slot.generation = generation;
        }
        inner.table.insert(key.to_vec(), idx);
        inner.usage += charge;
        inner.stats.insertions += 1;
        inner.evict_to_capacity(self.capacity);

        Ok(CacheHandle::new(idx, generation, value))
    }

    fn lookup(&self, key: &[u8]) -> Option<CacheHandle> {
        let mut inner = self.inner.lock();
        inner.stats.lookups += 1;

        let Some(&idx) = inner.table.get(key) else {
            inner.stats.misses += 1;
            return None;
        };
        inner.stats.hits += 1;
        if inner.slots[idx].refs == 0 {
            inner.lru_remove(idx);
        }
        let slot = &mut inner.slots[idx];
        slot.refs += 1;
        let value = slot.value.clone()?;
        Some(CacheHandle::new(idx, slot.generation, value))
    }

    fn release(&self, handle: CacheHandle) {
        let mut inner = self.inner.lock();
        let idx = handle.slot();
        let Some(slot) = inner.slots.get_mut(idx) else {
            return;
        };
        debug_assert_eq!(slot.generation, handle.generation(), "stale cache handle");
        if slot.generation != handle.generation() || slot.refs == 0 {
            return;
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }
        if slot.in_cache {
            inner.lru_push_back(idx);
            inner.evict_to_capacity(self.capacity);
        } else {
            inner.free_slot(idx);
        }
    }

    fn erase(&self, key: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.table.remove(key) {
            inner.detach(idx);
        }
    }

    fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn usage(&self) -> usize {
        self.inner.lock().usage
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }
}
