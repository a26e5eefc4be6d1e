//! Filters split into partitions aligned with the two-level index.
//!
//! Each partition is a full filter over the keys of one index partition. A
//! top-level block maps each partition's last separator to the handle of its
//! filter, so a probe touches the top level plus at most one partition.

use crate::comparator::{Comparator, SliceTransform};
use crate::error::{Error, Result};
use crate::filter::full::FullFilterBlockBuilder;
use crate::filter::FilterPolicy;
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::format::BlockHandle;
use crate::sstable::index::{FinishStep, PartitionCutLink};
use crate::sstable::iterator::InternalIterator;
use std::collections::VecDeque;
use std::sync::Arc;

/// Builds filter partitions as the index cuts its partitions.
pub struct PartitionedFilterBlockBuilder {
    current: FullFilterBlockBuilder,
    cuts: PartitionCutLink,
    /// Sealed partitions waiting to be written: (index key, filter).
    filters: VecDeque<(Vec<u8>, Vec<u8>)>,
    top_level: BlockBuilder,
    last_key: Option<Vec<u8>>,
    finishing: bool,
}

impl PartitionedFilterBlockBuilder {
    /// Create a builder that follows the partitions posted to `cuts`.
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        index_block_restart_interval: usize,
        cuts: PartitionCutLink,
    ) -> Self {
        Self {
            current: FullFilterBlockBuilder::new(policy, prefix_extractor, whole_key_filtering),
            cuts,
            filters: VecDeque::new(),
            top_level: BlockBuilder::new(index_block_restart_interval, true),
            last_key: None,
            finishing: false,
        }
    }

    /// Adds a key to the current partition.
    pub fn add(&mut self, key: &[u8]) {
        self.apply_cuts();
        self.current.add(key);
        self.last_key = Some(key.to_vec());
    }

    fn apply_cuts(&mut self) {
        for partition_key in self.cuts.drain() {
            self.cut(partition_key);
        }
    }

    fn cut(&mut self, partition_key: Vec<u8>) {
        let filter = self.current.finish();
        self.filters.push_back((partition_key, filter));
        self.last_key = None;
    }

    /// Number of sealed partitions not yet handed out.
    pub fn num_pending_partitions(&self) -> usize {
        self.filters.len()
    }

    /// Hands out one partition per call, then the top-level block.
    ///
    /// `last_handle` must be the handle at which the block returned by the
    /// previous call was written; it is ignored on the first call.
    pub fn finish(&mut self, last_handle: Option<BlockHandle>) -> Result<FinishStep> {
        if self.finishing {
            let handle = last_handle
                .ok_or_else(|| Error::invalid_state("filter partition finished without its handle"))?;
            let (key, _) = self
                .filters
                .pop_front()
                .ok_or_else(|| Error::invalid_state("no filter partition pending"))?;
            self.top_level.add(&key, &handle.encode());
        } else {
            self.apply_cuts();
            if self.current.num_added() > 0 {
                if let Some(key) = self.last_key.take() {
                    self.cut(key);
                }
            }
            self.finishing = true;
        }

        match self.filters.front() {
            Some((_, filter)) => Ok(FinishStep::Partial(filter.clone())),
            None => Ok(FinishStep::Complete(self.top_level.finish())),
        }
    }
}

/// Locates the partition responsible for a key.
pub struct PartitionedFilterBlockReader {
    top_level: Block,
    comparator: Arc<dyn Comparator>,
}

impl PartitionedFilterBlockReader {
    /// Wrap the top-level filter index block. Partitions are full filters
    /// and are read separately.
    pub fn new(top_level: Block, comparator: Arc<dyn Comparator>) -> Self {
        Self { top_level, comparator }
    }

    /// Handle of the partition covering `key`, or `None` if `key` is past
    /// the last partition.
    pub fn partition_for(&self, key: &[u8]) -> Result<Option<BlockHandle>> {
        let mut iter = self.top_level.iter(self.comparator.clone());
        iter.seek(key);
        iter.status()?;
        if !iter.valid() {
            return Ok(None);
        }
        BlockHandle::decode(iter.value()).map(Some)
    }

    /// Handles of up to `limit` consecutive partitions, starting with the
    /// one covering `key`.
    pub fn partitions_from(&self, key: &[u8], limit: usize) -> Result<Vec<BlockHandle>> {
        let mut iter = self.top_level.iter(self.comparator.clone());
        iter.seek(key);
        let mut out = Vec::with_capacity(limit);
        while iter.valid() && out.len() < limit {
            out.push(BlockHandle::decode(iter.value())?);
            iter.next();
        }
        iter.status()?;
        Ok(out)
    }

    /// Heap bytes held by the top level.
    pub fn approximate_memory_usage(&self) -> usize {
        self.top_level.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::filter::full::FullFilterBlockReader;
    use crate::filter::BloomFilterPolicy;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    /// Drives the finish protocol, placing each partition at a fake offset.
    fn finish_all(builder: &mut PartitionedFilterBlockBuilder) -> (Vec<u8>, HashMap<u64, Vec<u8>>, usize) {
        let mut partitions = HashMap::new();
        let mut offset = 0u64;
        let mut handle = None;
        let mut partial_steps = 0;
        loop {
            match builder.finish(handle).unwrap() {
                FinishStep::Partial(filter) => {
                    partial_steps += 1;
                    let h = BlockHandle::new(offset, filter.len() as u64);
                    offset += filter.len() as u64 + 5;
                    partitions.insert(h.offset(), filter);
                    handle = Some(h);
                }
                FinishStep::Complete(top) => return (top, partitions, partial_steps),
            }
        }
    }

    #[test]
    fn test_partitions_follow_cuts() {
        let cuts = PartitionCutLink::default();
        let mut builder = PartitionedFilterBlockBuilder::new(policy(), None, true, 1, cuts.clone());
        builder.add(b"apple");
        builder.add(b"banana");
        cuts.post(b"c".to_vec());
        builder.add(b"cherry");
        builder.add(b"grape");
        cuts.post(b"h".to_vec());
        builder.add(b"kiwi");
        cuts.post(b"l".to_vec());

        let (top, partitions, partial_steps) = finish_all(&mut builder);
        assert_eq!(partial_steps, 3);

        let reader = PartitionedFilterBlockReader::new(Block::new(Bytes::from(top)).unwrap(), BytewiseComparator::shared());
        let may_match = |key: &[u8]| -> bool {
            match reader.partition_for(key).unwrap() {
                None => false,
                Some(h) => {
                    let contents = Bytes::from(partitions[&h.offset()].clone());
                    FullFilterBlockReader::new(policy(), None, true, contents).key_may_match(key)
                }
            }
        };
        for key in [&b"apple"[..], b"banana", b"cherry", b"grape", b"kiwi"] {
            assert!(may_match(key), "{:?}", String::from_utf8_lossy(key));
        }
        assert!(!may_match(b"zebra"));
        assert!(!may_match(b"blueberry"));
    }

    #[test]
    fn test_trailing_keys_without_cut() {
        let cuts = PartitionCutLink::default();
        let mut builder = PartitionedFilterBlockBuilder::new(policy(), None, true, 1, cuts);
        builder.add(b"a");
        builder.add(b"b");
        let (_, partitions, partial_steps) = finish_all(&mut builder);
        assert_eq!(partial_steps, 1);
        assert_eq!(partitions.len(), 1);
    }

    #[test]
    fn test_missing_handle() {
        let cuts = PartitionCutLink::default();
        let mut builder = PartitionedFilterBlockBuilder::new(policy(), None, true, 1, cuts.clone());
        builder.add(b"a");
        cuts.post(b"a".to_vec());
        assert!(matches!(builder.finish(None).unwrap(), FinishStep::Partial(_)));
        assert!(builder.finish(None).is_err());
    }
}
