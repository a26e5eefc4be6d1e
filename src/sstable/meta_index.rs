//! The meta-index block: names of auxiliary blocks mapped to their handles.

use crate::comparator::BytewiseComparator;
use crate::error::Result;
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::format::BlockHandle;
use crate::sstable::iterator::InternalIterator;
use std::collections::BTreeMap;

/// Properties block.
pub const PROPERTIES_BLOCK: &str = "rocksdb.properties";
/// Compression dictionary block.
pub const COMPRESSION_DICT_BLOCK: &str = "rocksdb.compression_dict";
/// Range deletion block.
pub const RANGE_DEL_BLOCK: &str = "rocksdb.range_del";
/// Concatenated prefixes of the hash index.
pub const HASH_INDEX_PREFIXES_BLOCK: &str = "rocksdb.hashindex.prefixes";
/// Per-prefix metadata of the hash index.
pub const HASH_INDEX_PREFIXES_METADATA_BLOCK: &str = "rocksdb.hashindex.metadata";
/// Block-based filter, followed by the policy name.
pub const FILTER_BLOCK_PREFIX: &str = "filter.";
/// Full filter, followed by the policy name.
pub const FULL_FILTER_BLOCK_PREFIX: &str = "fullfilter.";
/// Partitioned filter, followed by the policy name.
pub const PARTITIONED_FILTER_BLOCK_PREFIX: &str = "partitionedfilter.";

/// Collects meta block handles and writes them in name order.
#[derive(Debug, Default)]
pub struct MetaIndexBuilder {
    handles: BTreeMap<String, BlockHandle>,
}

impl MetaIndexBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the handle of meta block `name`.
    pub fn add(&mut self, name: impl Into<String>, handle: BlockHandle) {
        self.handles.insert(name.into(), handle);
    }

    /// Serializes the meta-index block.
    pub fn finish(&self) -> Vec<u8> {
        let mut builder = BlockBuilder::new(1, true);
        for (name, handle) in &self.handles {
            builder.add(name.as_bytes(), &handle.encode());
        }
        builder.finish()
    }
}

/// Parsed meta-index block.
#[derive(Debug, Clone, Default)]
pub struct MetaIndex {
    handles: BTreeMap<String, BlockHandle>,
}

impl MetaIndex {
    /// Decodes every entry of `block`.
    pub fn from_block(block: &Block) -> Result<Self> {
        let mut handles = BTreeMap::new();
        let mut iter = block.iter(BytewiseComparator::shared());
        iter.seek_to_first();
        while iter.valid() {
            let handle = BlockHandle::decode(iter.value())?;
            handles.insert(String::from_utf8_lossy(iter.key()).into_owned(), handle);
            iter.next();
        }
        iter.status()?;
        Ok(Self { handles })
    }

    /// Handle of meta block `name`.
    pub fn find(&self, name: &str) -> Option<BlockHandle> {
        self.handles.get(name).copied()
    }

    /// Every entry in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BlockHandle)> {
        self.handles.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of meta blocks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if there are no meta blocks.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_meta_index_roundtrip() {
        let mut builder = MetaIndexBuilder::new();
        builder.add(PROPERTIES_BLOCK, BlockHandle::new(100, 50));
        builder.add(format!("{}rocksdb.BuiltinBloomFilter", FULL_FILTER_BLOCK_PREFIX), BlockHandle::new(10, 20));
        builder.add(RANGE_DEL_BLOCK, BlockHandle::new(155, 3));

        let block = Block::new(Bytes::from(builder.finish())).unwrap();
        let meta = MetaIndex::from_block(&block).unwrap();
        assert_eq!(meta.len(), 3);
        assert_eq!(meta.find(PROPERTIES_BLOCK), Some(BlockHandle::new(100, 50)));
        assert_eq!(meta.find("fullfilter.rocksdb.BuiltinBloomFilter"), Some(BlockHandle::new(10, 20)));
        assert_eq!(meta.find(COMPRESSION_DICT_BLOCK), None);

        let names: Vec<&str> = meta.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["fullfilter.rocksdb.BuiltinBloomFilter", "rocksdb.properties", "rocksdb.range_del"]);
    }

    #[test]
    fn test_empty_meta_index() {
        let block = Block::new(Bytes::from(MetaIndexBuilder::new().finish())).unwrap();
        assert!(MetaIndex::from_block(&block).unwrap().is_empty());
    }
}
