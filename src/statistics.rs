//! Best-effort counters for cache and I/O activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ticker {
    /// Index block not found in the block cache.
    BlockCacheIndexMiss,
    /// Index block found in the block cache.
    BlockCacheIndexHit,
    /// Filter block not found in the block cache.
    BlockCacheFilterMiss,
    /// Filter block found in the block cache.
    BlockCacheFilterHit,
    /// Data block not found in the block cache.
    BlockCacheDataMiss,
    /// Data block found in the block cache.
    BlockCacheDataHit,
    /// Blocks inserted into the block cache.
    BlockCacheAdd,
    /// Insertions rejected by the block cache.
    BlockCacheAddFailures,
    /// Block not found in the compressed block cache.
    BlockCacheCompressedMiss,
    /// Block found in the compressed block cache.
    BlockCacheCompressedHit,
    /// Block served by the persistent cache.
    PersistentCacheHit,
    /// Block not in the persistent cache.
    PersistentCacheMiss,
    /// Point lookups answered by a negative whole-key filter probe.
    BloomFilterUseful,
    /// Seeks answered by a negative prefix filter probe.
    BloomFilterPrefixUseful,
    /// Blocks read from the file.
    BlockRead,
    /// Bytes read from the file, trailers included.
    BytesRead,
    /// Blocks decompressed.
    BlockDecompressed,
    /// Blocks whose checksum did not verify.
    BlockChecksumFailure,
}

impl Ticker {
    /// Every ticker, in storage order.
    pub const ALL: [Ticker; 18] = [
        Ticker::BlockCacheIndexMiss,
        Ticker::BlockCacheIndexHit,
        Ticker::BlockCacheFilterMiss,
        Ticker::BlockCacheFilterHit,
        Ticker::BlockCacheDataMiss,
        Ticker::BlockCacheDataHit,
        Ticker::BlockCacheAdd,
        Ticker::BlockCacheAddFailures,
        Ticker::BlockCacheCompressedMiss,
        Ticker::BlockCacheCompressedHit,
        Ticker::PersistentCacheHit,
        Ticker::PersistentCacheMiss,
        Ticker::BloomFilterUseful,
        Ticker::BloomFilterPrefixUseful,
        Ticker::BlockRead,
        Ticker::BytesRead,
        Ticker::BlockDecompressed,
        Ticker::BlockChecksumFailure,
    ];

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Ticker::BlockCacheIndexMiss => "rocksdb.block.cache.index.miss",
            Ticker::BlockCacheIndexHit => "rocksdb.block.cache.index.hit",
            Ticker::BlockCacheFilterMiss => "rocksdb.block.cache.filter.miss",
            Ticker::BlockCacheFilterHit => "rocksdb.block.cache.filter.hit",
            Ticker::BlockCacheDataMiss => "rocksdb.block.cache.data.miss",
            Ticker::BlockCacheDataHit => "rocksdb.block.cache.data.hit",
            Ticker::BlockCacheAdd => "rocksdb.block.cache.add",
            Ticker::BlockCacheAddFailures => "rocksdb.block.cache.add.failures",
            Ticker::BlockCacheCompressedMiss => "rocksdb.block.cachecompressed.miss",
            Ticker::BlockCacheCompressedHit => "rocksdb.block.cachecompressed.hit",
            Ticker::PersistentCacheHit => "rocksdb.persistent.cache.hit",
            Ticker::PersistentCacheMiss => "rocksdb.persistent.cache.miss",
            Ticker::BloomFilterUseful => "rocksdb.bloom.filter.useful",
            Ticker::BloomFilterPrefixUseful => "rocksdb.bloom.filter.prefix.useful",
            Ticker::BlockRead => "rocksdb.block.read.count",
            Ticker::BytesRead => "rocksdb.bytes.read",
            Ticker::BlockDecompressed => "rocksdb.number.block.decompressed",
            Ticker::BlockChecksumFailure => "rocksdb.block.checksum.failure",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Thread-safe counter set.
#[derive(Debug)]
pub struct Statistics {
    tickers: [AtomicU64; Ticker::ALL.len()],
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Create a counter set with every ticker at zero.
    pub fn new() -> Self {
        Self { tickers: std::array::from_fn(|_| AtomicU64::new(0)) }
    }

    /// Adds `count` to `ticker`.
    pub fn record(&self, ticker: Ticker, count: u64) {
        self.tickers[ticker.index()].fetch_add(count, Ordering::Relaxed);
    }

    /// Current value of `ticker`.
    pub fn get(&self, ticker: Ticker) -> u64 {
        self.tickers[ticker.index()].load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for t in &self.tickers {
            t.store(0, Ordering::Relaxed);
        }
    }

    /// Name and value of every ticker.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Ticker::ALL.iter().map(|t| (t.name(), self.get(*t))).collect()
    }
}

/// Records into an optional sink.
pub(crate) fn record_tick(stats: Option<&Statistics>, ticker: Ticker, count: u64) {
    if let Some(stats) = stats {
        stats.record(ticker, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_order_matches_discriminants() {
        for (i, t) in Ticker::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn test_record_and_reset() {
        let stats = Statistics::new();
        stats.record(Ticker::BlockRead, 2);
        record_tick(Some(&stats), Ticker::BlockRead, 1);
        record_tick(None, Ticker::BlockRead, 100);
        assert_eq!(stats.get(Ticker::BlockRead), 3);
        assert_eq!(stats.get(Ticker::BytesRead), 0);
        assert!(stats.snapshot().contains(&("rocksdb.block.read.count", 3)));

        stats.reset();
        assert_eq!(stats.get(Ticker::BlockRead), 0);
    }
}
