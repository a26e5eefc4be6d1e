//! Key ordering and key prefix extraction.

use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over keys.
///
/// The name is persisted in the table properties, so an implementation must
/// never change its ordering without also changing its name.
pub trait Comparator: Send + Sync {
    /// Name recorded in `rocksdb.comparator`.
    fn name(&self) -> &str;

    /// Three-way comparison of two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// If `start < limit`, shortens `start` to some key in `[start, limit)`.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// Changes `key` to a short key that is `>= key`.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Lexicographic byte-wise order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl BytewiseComparator {
    /// Shared handle to the default comparator.
    pub fn shared() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }
}

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "leveldb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let min_len = start.len().min(limit.len());
        let diff = start.iter().zip(limit).take_while(|(a, b)| a == b).count();
        if diff >= min_len {
            // One is a prefix of the other.
            return;
        }
        let byte = start[diff];
        if byte < 0xff && byte + 1 < limit[diff] {
            start[diff] += 1;
            start.truncate(diff + 1);
            debug_assert!(self.compare(start, limit) == Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        if let Some(pos) = key.iter().position(|&b| b != 0xff) {
            key[pos] += 1;
            key.truncate(pos + 1);
        }
        // All 0xff: leave as is.
    }
}

/// Extracts a prefix from a key, used for prefix bloom filtering and the hash
/// index.
pub trait SliceTransform: Send + Sync {
    /// Name recorded in `rocksdb.prefix.extractor.name`.
    fn name(&self) -> &str;

    /// Returns the prefix of `key`. Only valid when `in_domain(key)`.
    fn transform<'a>(&self, key: &'a [u8]) -> &'a [u8];

    /// Whether `transform` is defined for `key`.
    fn in_domain(&self, key: &[u8]) -> bool;
}

/// Uses the first `len` bytes of a key as its prefix.
#[derive(Debug, Clone)]
pub struct FixedPrefixTransform {
    len: usize,
    name: String,
}

impl FixedPrefixTransform {
    /// Create a transform that keeps `len` leading bytes.
    pub fn new(len: usize) -> Self {
        Self { len, name: format!("rocksdb.FixedPrefix.{}", len) }
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> usize {
        self.len
    }
}

impl SliceTransform for FixedPrefixTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        &key[..self.len.min(key.len())]
    }

    fn in_domain(&self, key: &[u8]) -> bool {
        key.len() >= self.len
    }
}
