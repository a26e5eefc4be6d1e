//! Index builders.
//!
//! An index maps a separator key per data block to that block's handle. The
//! separator is `>=` every key of its block and `<` every key of the next
//! one, shortened by the comparator to save space.
//!
//! - [`ShortenedIndexBuilder`]: one index block searched with binary search.
//! - [`HashIndexBuilder`]: the same block plus a prefix map written to two
//!   meta blocks, for point lookups under a prefix extractor.
//! - [`PartitionedIndexBuilder`]: index partitions sized by
//!   `metadata_block_size` and a top-level block pointing at them.

use crate::comparator::{Comparator, SliceTransform};
use crate::config::{IndexType, TableOptions};
use crate::coding::put_varint32;
use crate::error::{Error, Result};
use crate::sstable::block::BlockBuilder;
use crate::sstable::flush_policy::{FlushBlockBySizePolicy, FlushBlockPolicy};
use crate::sstable::format::BlockHandle;
use crate::sstable::meta_index::{HASH_INDEX_PREFIXES_BLOCK, HASH_INDEX_PREFIXES_METADATA_BLOCK};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One step of a multi-block finish.
///
/// Partitioned structures are written one block at a time: every
/// `Partial` block must be written and its handle passed to the next
/// `finish` call, until `Complete` hands out the final block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishStep {
    /// A block that is not the last one.
    Partial(Vec<u8>),
    /// The last block.
    Complete(Vec<u8>),
}

/// Partition boundaries posted by the partitioned index builder and
/// consumed by the partitioned filter builder, so that filter partitions
/// are cut exactly where index partitions are sealed.
#[derive(Debug, Clone, Default)]
pub struct PartitionCutLink {
    pending: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl PartitionCutLink {
    /// Announces a sealed partition whose top-level key is `key`.
    pub fn post(&self, key: Vec<u8>) {
        self.pending.lock().push_back(key);
    }

    /// Takes every pending cut, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.pending.lock().drain(..).collect()
    }
}

/// Flat index with shortened separators.
pub struct ShortenedIndexBuilder {
    comparator: Arc<dyn Comparator>,
    builder: BlockBuilder,
}

impl ShortenedIndexBuilder {
    /// Create a builder.
    pub fn new(comparator: Arc<dyn Comparator>, index_block_restart_interval: usize) -> Self {
        Self { comparator, builder: BlockBuilder::new(index_block_restart_interval, true) }
    }

    /// Adds the entry of the block ending at `last_key_in_current_block` and
    /// returns the separator used.
    pub fn add_index_entry(
        &mut self,
        last_key_in_current_block: &[u8],
        first_key_in_next_block: Option<&[u8]>,
        handle: &BlockHandle,
    ) -> Vec<u8> {
        let mut separator = last_key_in_current_block.to_vec();
        match first_key_in_next_block {
            Some(next) => self.comparator.find_shortest_separator(&mut separator, next),
            None => self.comparator.find_short_successor(&mut separator),
        }
        self.builder.add(&separator, &handle.encode());
        separator
    }

    /// The block under construction.
    pub fn block(&self) -> &BlockBuilder {
        &self.builder
    }

    /// Whether no entry was added since the last finish.
    pub fn is_empty(&self) -> bool {
        self.builder.is_empty()
    }

    /// Serializes the index block and resets the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        self.builder.finish()
    }

    /// Size of the index block if finished now.
    pub fn estimated_size(&self) -> usize {
        self.builder.current_size_estimate()
    }
}

/// Binary search index plus a prefix to block-range map.
///
/// The map is written as two meta blocks: the concatenated prefixes, and for
/// each prefix the varint32 triple `(prefix length, first index entry,
/// number of blocks)`.
pub struct HashIndexBuilder {
    primary: ShortenedIndexBuilder,
    prefix_extractor: Arc<dyn SliceTransform>,
    /// Index of the entry the current data block will get.
    current_restart_index: u32,
    pending_block_num: u32,
    pending_entry_index: u32,
    pending_entry_prefix: Vec<u8>,
    prefix_block: Vec<u8>,
    prefix_meta_block: Vec<u8>,
}

impl HashIndexBuilder {
    /// Create a builder. Every index entry is a restart point so that the
    /// entry index doubles as the restart index.
    pub fn new(comparator: Arc<dyn Comparator>, prefix_extractor: Arc<dyn SliceTransform>) -> Self {
        Self {
            primary: ShortenedIndexBuilder::new(comparator, 1),
            prefix_extractor,
            current_restart_index: 0,
            pending_block_num: 0,
            pending_entry_index: 0,
            pending_entry_prefix: Vec::new(),
            prefix_block: Vec::new(),
            prefix_meta_block: Vec::new(),
        }
    }

    /// See [`ShortenedIndexBuilder::add_index_entry`].
    pub fn add_index_entry(
        &mut self,
        last_key_in_current_block: &[u8],
        first_key_in_next_block: Option<&[u8]>,
        handle: &BlockHandle,
    ) {
        self.current_restart_index += 1;
        self.primary.add_index_entry(last_key_in_current_block, first_key_in_next_block, handle);
    }

    /// Records the prefix of a key added to the current data block.
    pub fn on_key_added(&mut self, key: &[u8]) {
        if !self.prefix_extractor.in_domain(key) {
            return;
        }
        let key_prefix = self.prefix_extractor.transform(key);
        let is_first_entry = self.pending_block_num == 0;

        // Keys may share the prefix
        if is_first_entry || self.pending_entry_prefix != key_prefix {
            if !is_first_entry {
                self.flush_pending_prefix();
            }
            // Need a hard copy otherwise the underlying data changes all the time.
            self.pending_entry_prefix = key_prefix.to_vec();
            self.pending_block_num = 1;
            self.pending_entry_index = self.current_restart_index;
        } else {
            // Entry number increments when keys share the prefix but reside
            // in different data blocks.
            let last_restart_index = self.pending_entry_index + self.pending_block_num - 1;
            debug_assert!(last_restart_index <= self.current_restart_index);
            if last_restart_index != self.current_restart_index {
                self.pending_block_num += 1;
            }
        }
    }

    fn flush_pending_prefix(&mut self) {
        self.prefix_block.extend_from_slice(&self.pending_entry_prefix);
        put_varint32(&mut self.prefix_meta_block, self.pending_entry_prefix.len() as u32);
        put_varint32(&mut self.prefix_meta_block, self.pending_entry_index);
        put_varint32(&mut self.prefix_meta_block, self.pending_block_num);
    }

    /// Serializes the index block and closes the prefix map.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.pending_block_num != 0 {
            self.flush_pending_prefix();
            self.pending_block_num = 0;
        }
        self.primary.finish()
    }

    /// The two prefix meta blocks. Empty until [`finish`](Self::finish).
    pub fn take_meta_blocks(&mut self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (HASH_INDEX_PREFIXES_BLOCK, std::mem::take(&mut self.prefix_block)),
            (HASH_INDEX_PREFIXES_METADATA_BLOCK, std::mem::take(&mut self.prefix_meta_block)),
        ]
    }

    /// Size of the index block plus the prefix map if finished now.
    pub fn estimated_size(&self) -> usize {
        self.primary.estimated_size() + self.prefix_block.len() + self.prefix_meta_block.len()
    }
}

/// Two-level index: partitions of at most about `metadata_block_size`, and a
/// top-level block mapping each partition's last separator to its handle.
pub struct PartitionedIndexBuilder {
    sub_builder: ShortenedIndexBuilder,
    sub_index_last_key: Vec<u8>,
    flush_policy: FlushBlockBySizePolicy,
    /// Sealed partitions not yet written: (top-level key, contents).
    entries: VecDeque<(Vec<u8>, Vec<u8>)>,
    sealed_size: usize,
    top_level: BlockBuilder,
    cuts: PartitionCutLink,
    finishing: bool,
}

impl PartitionedIndexBuilder {
    /// Create a builder from the table options.
    pub fn new(options: &TableOptions) -> Self {
        Self {
            sub_builder: ShortenedIndexBuilder::new(options.comparator.clone(), options.index_block_restart_interval),
            sub_index_last_key: Vec::new(),
            flush_policy: FlushBlockBySizePolicy::new(options.metadata_block_size, options.block_size_deviation),
            entries: VecDeque::new(),
            sealed_size: 0,
            top_level: BlockBuilder::new(options.index_block_restart_interval, true),
            cuts: PartitionCutLink::default(),
            finishing: false,
        }
    }

    /// Link to hand to a partitioned filter builder.
    pub fn partition_cut_link(&self) -> PartitionCutLink {
        self.cuts.clone()
    }

    /// Adds the entry of one data block. The partition is sealed after the
    /// entry when the data ends or the next entry would overflow it.
    pub fn add_index_entry(
        &mut self,
        last_key_in_current_block: &[u8],
        first_key_in_next_block: Option<&[u8]>,
        handle: &BlockHandle,
    ) {
        self.sub_index_last_key =
            self.sub_builder.add_index_entry(last_key_in_current_block, first_key_in_next_block, handle);
        let seal = match first_key_in_next_block {
            None => true,
            Some(next) => {
                let handle_encoding = handle.encode();
                self.flush_policy.update(self.sub_builder.block(), next, &handle_encoding)
            }
        };
        if seal {
            self.seal_partition();
        }
    }

    fn seal_partition(&mut self) {
        if self.sub_builder.is_empty() {
            return;
        }
        let contents = self.sub_builder.finish();
        self.sealed_size += contents.len();
        let key = std::mem::take(&mut self.sub_index_last_key);
        self.cuts.post(key.clone());
        self.entries.push_back((key, contents));
    }

    /// Number of partitions sealed so far and not yet handed out.
    pub fn num_pending_partitions(&self) -> usize {
        self.entries.len()
    }

    /// Hands out one partition per call, then the top-level block.
    ///
    /// `last_handle` must be where the block from the previous call was
    /// written; it is ignored on the first call.
    pub fn finish(&mut self, last_handle: Option<BlockHandle>) -> Result<FinishStep> {
        if self.finishing {
            let handle = last_handle
                .ok_or_else(|| Error::invalid_state("index partition finished without its handle"))?;
            let (key, _) = self
                .entries
                .pop_front()
                .ok_or_else(|| Error::invalid_state("no index partition pending"))?;
            self.top_level.add(&key, &handle.encode());
        } else {
            self.seal_partition();
            self.finishing = true;
        }

        match self.entries.front() {
            Some((_, contents)) => Ok(FinishStep::Partial(contents.clone())),
            None => Ok(FinishStep::Complete(self.top_level.finish())),
        }
    }

    /// Sealed partitions, the partition in progress and the top level.
    /// Never decreases while entries are added.
    pub fn estimated_size(&self) -> usize {
        self.sealed_size + self.sub_builder.estimated_size() + self.top_level.current_size_estimate()
    }
}

/// Index builder for any [`IndexType`].
pub enum IndexBuilder {
    /// See [`ShortenedIndexBuilder`].
    Binary(ShortenedIndexBuilder),
    /// See [`HashIndexBuilder`].
    Hash(HashIndexBuilder),
    /// See [`PartitionedIndexBuilder`].
    TwoLevel(PartitionedIndexBuilder),
}

impl IndexBuilder {
    /// Picks the variant from `options.index_type`.
    pub fn from_options(options: &TableOptions) -> Result<Self> {
        Ok(match options.index_type {
            IndexType::BinarySearch => IndexBuilder::Binary(ShortenedIndexBuilder::new(
                options.comparator.clone(),
                options.index_block_restart_interval,
            )),
            IndexType::HashSearch => {
                let extractor = options
                    .prefix_extractor
                    .clone()
                    .ok_or_else(|| Error::invalid_argument("hash index requires a prefix extractor"))?;
                IndexBuilder::Hash(HashIndexBuilder::new(options.comparator.clone(), extractor))
            }
            IndexType::TwoLevelIndexSearch => IndexBuilder::TwoLevel(PartitionedIndexBuilder::new(options)),
        })
    }

    /// Variant of this builder.
    pub fn index_type(&self) -> IndexType {
        match self {
            IndexBuilder::Binary(_) => IndexType::BinarySearch,
            IndexBuilder::Hash(_) => IndexType::HashSearch,
            IndexBuilder::TwoLevel(_) => IndexType::TwoLevelIndexSearch,
        }
    }

    /// Adds the entry of the block that ends at `last_key_in_current_block`.
    /// `first_key_in_next_block` is `None` for the last block of the table.
    pub fn add_index_entry(
        &mut self,
        last_key_in_current_block: &[u8],
        first_key_in_next_block: Option<&[u8]>,
        handle: &BlockHandle,
    ) {
        match self {
            IndexBuilder::Binary(b) => {
                b.add_index_entry(last_key_in_current_block, first_key_in_next_block, handle);
            }
            IndexBuilder::Hash(b) => b.add_index_entry(last_key_in_current_block, first_key_in_next_block, handle),
            IndexBuilder::TwoLevel(b) => b.add_index_entry(last_key_in_current_block, first_key_in_next_block, handle),
        }
    }

    /// Called for every key added to a data block.
    pub fn on_key_added(&mut self, key: &[u8]) {
        if let IndexBuilder::Hash(b) = self {
            b.on_key_added(key);
        }
    }

    /// Emits the next index block. Only the two-level index produces
    /// [`FinishStep::Partial`] steps.
    pub fn finish(&mut self, last_handle: Option<BlockHandle>) -> Result<FinishStep> {
        match self {
            IndexBuilder::Binary(b) => Ok(FinishStep::Complete(b.finish())),
            IndexBuilder::Hash(b) => Ok(FinishStep::Complete(b.finish())),
            IndexBuilder::TwoLevel(b) => b.finish(last_handle),
        }
    }

    /// Meta blocks to write alongside the index, available after the first
    /// `finish` call.
    pub fn take_meta_blocks(&mut self) -> Vec<(&'static str, Vec<u8>)> {
        match self {
            IndexBuilder::Hash(b) => b.take_meta_blocks(),
            _ => Vec::new(),
        }
    }

    /// Estimated size of everything the index will write.
    pub fn estimated_size(&self) -> usize {
        match self {
            IndexBuilder::Binary(b) => b.estimated_size(),
            IndexBuilder::Hash(b) => b.estimated_size(),
            IndexBuilder::TwoLevel(b) => b.estimated_size(),
        }
    }

    /// Link for a partitioned filter; only the two-level index has one.
    pub fn partition_cut_link(&self) -> Option<PartitionCutLink> {
        match self {
            IndexBuilder::TwoLevel(b) => Some(b.partition_cut_link()),
            _ => None,
        }
    }
}
