//! Index readers and their iterators.
//!
//! An index iterator yields `(separator, encoded BlockHandle)` pairs for data
//! blocks in key order. The two-level index walks its partitions through a
//! [`BlockFetcher`] supplied by the table.

use crate::coding::get_varint32;
use crate::comparator::{Comparator, SliceTransform};
use crate::config::IndexType;
use crate::error::{Error, Result};
use crate::sstable::block::{Block, BlockIter};
use crate::sstable::iterator::{BlockFetcher, InternalIterator, TwoLevelIterator};
use std::collections::HashMap;
use std::sync::Arc;

/// Prefix to index-entry range map of a hash index.
pub struct HashPrefixIndex {
    extractor: Arc<dyn SliceTransform>,
    /// prefix -> (first index entry, number of entries)
    ranges: HashMap<Vec<u8>, (u32, u32)>,
}

/// Result of a prefix lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixLookup {
    /// The key is outside the extractor's domain.
    NotInDomain,
    /// No block holds a key with this prefix.
    Absent,
    /// Index entries `[first, first + count)` hold the prefix.
    Range {
        /// First index entry.
        first: u32,
        /// Number of entries.
        count: u32,
    },
}

impl HashPrefixIndex {
    /// Parses the prefixes and metadata meta blocks.
    pub fn decode(extractor: Arc<dyn SliceTransform>, prefixes: &[u8], metadata: &[u8]) -> Result<Self> {
        let mut ranges = HashMap::new();
        let mut meta = metadata;
        let mut pos = 0usize;
        while !meta.is_empty() {
            let (Some(len), Some(first), Some(count)) =
                (get_varint32(&mut meta), get_varint32(&mut meta), get_varint32(&mut meta))
            else {
                return Err(Error::corruption("bad hash index metadata"));
            };
            let end = pos
                .checked_add(len as usize)
                .filter(|&end| end <= prefixes.len())
                .ok_or_else(|| Error::corruption("hash index prefix out of range"))?;
            ranges.insert(prefixes[pos..end].to_vec(), (first, count));
            pos = end;
        }
        if pos != prefixes.len() {
            return Err(Error::corruption("hash index prefixes and metadata disagree"));
        }
        Ok(Self { extractor, ranges })
    }

    /// Looks up the prefix of `key`.
    pub fn lookup(&self, key: &[u8]) -> PrefixLookup {
        if !self.extractor.in_domain(key) {
            return PrefixLookup::NotInDomain;
        }
        match self.ranges.get(self.extractor.transform(key)) {
            Some(&(first, count)) => PrefixLookup::Range { first, count },
            None => PrefixLookup::Absent,
        }
    }

    /// Number of distinct prefixes.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Check if no prefix is recorded.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn approximate_memory_usage(&self) -> usize {
        self.ranges.keys().map(|k| k.len() + 8).sum()
    }
}

/// Index of one table.
pub enum IndexReader {
    /// Single index block.
    Binary {
        /// Index block.
        block: Block,
        /// Key order.
        comparator: Arc<dyn Comparator>,
    },
    /// Index block plus prefix map.
    Hash {
        /// Index block, one restart point per entry.
        block: Block,
        /// Key order.
        comparator: Arc<dyn Comparator>,
        /// Prefix map.
        prefix_index: Arc<HashPrefixIndex>,
    },
    /// Top-level block over index partitions.
    Partitioned {
        /// Top-level block.
        top_level: Block,
        /// Key order.
        comparator: Arc<dyn Comparator>,
    },
}

impl IndexReader {
    /// Variant of this index.
    pub fn index_type(&self) -> IndexType {
        match self {
            IndexReader::Binary { .. } => IndexType::BinarySearch,
            IndexReader::Hash { .. } => IndexType::HashSearch,
            IndexReader::Partitioned { .. } => IndexType::TwoLevelIndexSearch,
        }
    }

    /// The block referenced by the footer.
    pub fn block(&self) -> &Block {
        match self {
            IndexReader::Binary { block, .. } | IndexReader::Hash { block, .. } => block,
            IndexReader::Partitioned { top_level, .. } => top_level,
        }
    }

    /// Heap bytes held by the reader.
    pub fn approximate_memory_usage(&self) -> usize {
        match self {
            IndexReader::Hash { block, prefix_index, .. } => block.size() + prefix_index.approximate_memory_usage(),
            _ => self.block().size(),
        }
    }

    /// Iterator over data block handles. `partitions` loads index partitions
    /// and is only used by the two-level index. `total_order_seek` disables
    /// the prefix map.
    pub fn new_iterator<F: BlockFetcher>(&self, partitions: F, total_order_seek: bool) -> IndexIterator<F> {
        match self {
            IndexReader::Binary { block, comparator } => IndexIterator::Block(block.iter(comparator.clone())),
            IndexReader::Hash { block, comparator, prefix_index } => {
                let iter = block.iter(comparator.clone());
                if total_order_seek {
                    IndexIterator::Block(iter)
                } else {
                    IndexIterator::Hash { iter, prefix_index: prefix_index.clone() }
                }
            }
            IndexReader::Partitioned { top_level, comparator } => {
                IndexIterator::Partitioned(TwoLevelIterator::new(top_level.iter(comparator.clone()), partitions))
            }
        }
    }
}

/// Iterator over an [`IndexReader`].
pub enum IndexIterator<F> {
    /// Binary search over one block.
    Block(BlockIter),
    /// Seeks restricted to the blocks holding the target's prefix.
    Hash {
        /// Underlying block iterator.
        iter: BlockIter,
        /// Prefix map.
        prefix_index: Arc<HashPrefixIndex>,
    },
    /// Iterates partitions of a two-level index.
    Partitioned(TwoLevelIterator<BlockIter, F>),
}

impl<F: BlockFetcher> InternalIterator for IndexIterator<F> {
    fn valid(&self) -> bool {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.valid(),
            IndexIterator::Partitioned(iter) => iter.valid(),
        }
    }

    fn seek_to_first(&mut self) {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.seek_to_first(),
            IndexIterator::Partitioned(iter) => iter.seek_to_first(),
        }
    }

    fn seek(&mut self, target: &[u8]) {
        match self {
            IndexIterator::Block(iter) => iter.seek(target),
            IndexIterator::Hash { iter, prefix_index } => match prefix_index.lookup(target) {
                PrefixLookup::NotInDomain => iter.seek(target),
                // Leaves the iterator invalid with an ok status.
                PrefixLookup::Absent => iter.seek_in_restart_range(target, 0, 0),
                PrefixLookup::Range { first, count } => iter.seek_in_restart_range(target, first, count),
            },
            IndexIterator::Partitioned(iter) => iter.seek(target),
        }
    }

    fn next(&mut self) {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.next(),
            IndexIterator::Partitioned(iter) => iter.next(),
        }
    }

    fn key(&self) -> &[u8] {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.key(),
            IndexIterator::Partitioned(iter) => iter.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.value(),
            IndexIterator::Partitioned(iter) => iter.value(),
        }
    }

    fn status(&self) -> Result<()> {
        match self {
            IndexIterator::Block(iter) | IndexIterator::Hash { iter, .. } => iter.status(),
            IndexIterator::Partitioned(iter) => iter.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachableEntry;
    use crate::comparator::{BytewiseComparator, FixedPrefixTransform};
    use crate::sstable::format::BlockHandle;
    use crate::sstable::index::HashIndexBuilder;
    use bytes::Bytes;

    struct NoPartitions;

    impl BlockFetcher for NoPartitions {
        fn fetch_block(&self, _handle_value: &[u8]) -> Result<CachableEntry<Block>> {
            Err(Error::invalid_state("no partitions"))
        }

        fn comparator(&self) -> Arc<dyn Comparator> {
            BytewiseComparator::shared()
        }
    }

    fn hash_reader() -> IndexReader {
        let extractor: Arc<dyn SliceTransform> = Arc::new(FixedPrefixTransform::new(2));
        let mut builder = HashIndexBuilder::new(BytewiseComparator::shared(), extractor.clone());
        // Blocks: [aa1 aa2] [aa3 cc1] [cc2 ee1]
        let blocks: [&[&[u8]]; 3] = [&[b"aa1", b"aa2"], &[b"aa3", b"cc1"], &[b"cc2", b"ee1"]];
        for (i, keys) in blocks.iter().enumerate() {
            for key in keys.iter() {
                builder.on_key_added(key);
            }
            let next = blocks.get(i + 1).map(|b| b[0]);
            builder.add_index_entry(keys[keys.len() - 1], next, &BlockHandle::new(i as u64 * 100, 90));
        }
        let block = Block::new(Bytes::from(builder.finish())).unwrap();
        let meta = builder.take_meta_blocks();
        let prefix_index = HashPrefixIndex::decode(extractor, &meta[0].1, &meta[1].1).unwrap();
        assert_eq!(prefix_index.len(), 3);
        IndexReader::Hash { block, comparator: BytewiseComparator::shared(), prefix_index: Arc::new(prefix_index) }
    }

    fn seek_offset(iter: &mut IndexIterator<NoPartitions>, target: &[u8]) -> Option<u64> {
        iter.seek(target);
        assert!(iter.status().is_ok());
        iter.valid().then(|| BlockHandle::decode(iter.value()).unwrap().offset())
    }

    #[test]
    fn test_hash_seek_uses_prefix_ranges() {
        let reader = hash_reader();
        assert_eq!(reader.index_type(), IndexType::HashSearch);
        let mut iter = reader.new_iterator(NoPartitions, false);

        assert_eq!(seek_offset(&mut iter, b"aa3"), Some(100));
        assert_eq!(seek_offset(&mut iter, b"cc2"), Some(200));
        assert_eq!(seek_offset(&mut iter, b"ee1"), Some(200));
        // Prefix never written.
        assert_eq!(seek_offset(&mut iter, b"bb1"), None);
        // Out of domain falls back to binary search.
        assert_eq!(seek_offset(&mut iter, b"b"), Some(100));
    }

    #[test]
    fn test_total_order_seek_ignores_prefixes() {
        let reader = hash_reader();
        let mut iter = reader.new_iterator(NoPartitions, true);
        assert_eq!(seek_offset(&mut iter, b"bb1"), Some(100));
    }

    #[test]
    fn test_bad_hash_metadata() {
        let extractor: Arc<dyn SliceTransform> = Arc::new(FixedPrefixTransform::new(2));
        // Prefix length 5 with only 2 prefix bytes.
        assert!(HashPrefixIndex::decode(extractor.clone(), b"aa", &[5, 0, 1]).is_err());
        // Truncated triple.
        assert!(HashPrefixIndex::decode(extractor.clone(), b"aa", &[2, 0]).is_err());
        // Unused prefix bytes.
        assert!(HashPrefixIndex::decode(extractor, b"aabb", &[2, 0, 1]).is_err());
    }
}
