//! Filter implementations for efficient key existence checking.
//!
//! A [`FilterPolicy`] turns a set of keys into an opaque filter. Tables lay
//! filters out in one of three shapes:
//! - block-based: one filter per 2KB range of data block offsets
//! - full: one filter for the whole table
//! - partitioned: full filters per index partition plus a top-level index

pub mod block_based;
pub mod bloom;
pub mod full;
pub mod partitioned;

pub use block_based::{BlockBasedFilterBlockBuilder, BlockBasedFilterBlockReader};
pub use bloom::{BloomFilter, BloomFilterPolicy};
pub use full::{FullFilterBlockBuilder, FullFilterBlockReader};
pub use partitioned::{PartitionedFilterBlockBuilder, PartitionedFilterBlockReader};

use crate::comparator::{Comparator, SliceTransform};
use crate::config::TableOptions;
use crate::error::Result;
use crate::sstable::block::Block;
use crate::sstable::format::BlockHandle;
use crate::sstable::index::{FinishStep, PartitionCutLink};
use bytes::Bytes;
use std::sync::Arc;

/// Filter trait for key existence checking
pub trait Filter {
    /// Check if a key may exist (can have false positives)
    fn may_contain(&self, key: &[u8]) -> bool;

    /// Add a key to the filter
    fn add(&mut self, key: &[u8]);

    /// Get the serialized representation of the filter
    fn encode(&self) -> Vec<u8>;

    /// Create a filter from serialized data
    fn decode(data: &[u8]) -> crate::Result<Self>
    where
        Self: Sized;
}

/// Builds and probes serialized filters.
///
/// The name is persisted in the meta-index; a table is only probed with a
/// policy of the same name.
pub trait FilterPolicy: Send + Sync {
    /// Persisted policy name.
    fn name(&self) -> &str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// False only if `key` was definitely not in the key set of `filter`.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;

    /// Whether tables should use one filter per data block.
    fn use_block_based_builder(&self) -> bool {
        false
    }
}

/// Filter layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// One filter per 2KB of data block offsets.
    BlockBased,
    /// One filter for the whole table.
    Full,
    /// Filters partitioned along the two-level index.
    Partitioned,
}

impl FilterType {
    /// Meta-index key prefix; the full key appends the policy name.
    pub fn meta_key_prefix(&self) -> &'static str {
        match self {
            FilterType::BlockBased => crate::sstable::meta_index::FILTER_BLOCK_PREFIX,
            FilterType::Full => crate::sstable::meta_index::FULL_FILTER_BLOCK_PREFIX,
            FilterType::Partitioned => crate::sstable::meta_index::PARTITIONED_FILTER_BLOCK_PREFIX,
        }
    }

    /// Meta-index key for a filter built by `policy`.
    pub fn meta_key(&self, policy: &dyn FilterPolicy) -> String {
        format!("{}{}", self.meta_key_prefix(), policy.name())
    }
}

/// Filter builder for any layout.
pub enum FilterBlockBuilder {
    /// See [`BlockBasedFilterBlockBuilder`].
    BlockBased(BlockBasedFilterBlockBuilder),
    /// See [`FullFilterBlockBuilder`].
    Full {
        /// Inner builder.
        builder: FullFilterBlockBuilder,
        /// Set once the filter was handed out.
        done: bool,
    },
    /// See [`PartitionedFilterBlockBuilder`].
    Partitioned(PartitionedFilterBlockBuilder),
}

impl FilterBlockBuilder {
    /// Picks the layout from `options`. `cuts` must be the link of the
    /// partitioned index builder when filters are partitioned.
    pub fn from_options(options: &TableOptions, cuts: Option<PartitionCutLink>) -> Option<Self> {
        let policy = options.filter_policy.clone()?;
        let extractor = options.prefix_extractor.clone();
        let whole_key = options.whole_key_filtering;
        if policy.use_block_based_builder() {
            let mut builder = BlockBasedFilterBlockBuilder::new(policy, extractor, whole_key);
            builder.start_block(0);
            return Some(FilterBlockBuilder::BlockBased(builder));
        }
        match cuts {
            Some(cuts) if options.partition_filters => {
                Some(FilterBlockBuilder::Partitioned(PartitionedFilterBlockBuilder::new(
                    policy,
                    extractor,
                    whole_key,
                    options.index_block_restart_interval,
                    cuts,
                )))
            }
            _ => Some(FilterBlockBuilder::Full {
                builder: FullFilterBlockBuilder::new(policy, extractor, whole_key),
                done: false,
            }),
        }
    }

    /// Layout produced by this builder.
    pub fn filter_type(&self) -> FilterType {
        match self {
            FilterBlockBuilder::BlockBased(_) => FilterType::BlockBased,
            FilterBlockBuilder::Full { .. } => FilterType::Full,
            FilterBlockBuilder::Partitioned(_) => FilterType::Partitioned,
        }
    }

    /// Whether filters are kept per data block.
    pub fn is_block_based(&self) -> bool {
        matches!(self, FilterBlockBuilder::BlockBased(_))
    }

    /// A data block starts at `block_offset`.
    pub fn start_block(&mut self, block_offset: u64) {
        if let FilterBlockBuilder::BlockBased(builder) = self {
            builder.start_block(block_offset);
        }
    }

    /// Adds a key.
    pub fn add(&mut self, key: &[u8]) {
        match self {
            FilterBlockBuilder::BlockBased(builder) => builder.add(key),
            FilterBlockBuilder::Full { builder, .. } => builder.add(key),
            FilterBlockBuilder::Partitioned(builder) => builder.add(key),
        }
    }

    /// Emits the next filter block. Only partitioned filters produce
    /// [`FinishStep::Partial`] steps.
    pub fn finish(&mut self, last_handle: Option<BlockHandle>) -> Result<FinishStep> {
        match self {
            FilterBlockBuilder::BlockBased(builder) => Ok(FinishStep::Complete(builder.finish())),
            FilterBlockBuilder::Full { builder, done } => {
                if *done {
                    return Err(crate::Error::invalid_state("filter already finished"));
                }
                *done = true;
                Ok(FinishStep::Complete(builder.finish()))
            }
            FilterBlockBuilder::Partitioned(builder) => builder.finish(last_handle),
        }
    }
}

/// Filter reader for any layout.
pub enum FilterBlockReader {
    /// See [`BlockBasedFilterBlockReader`].
    BlockBased(BlockBasedFilterBlockReader),
    /// See [`FullFilterBlockReader`].
    Full(FullFilterBlockReader),
    /// See [`PartitionedFilterBlockReader`].
    Partitioned(PartitionedFilterBlockReader),
}

impl FilterBlockReader {
    /// Parses filter `contents` of the given layout.
    pub fn new(
        filter_type: FilterType,
        contents: Bytes,
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Self> {
        Ok(match filter_type {
            FilterType::BlockBased => FilterBlockReader::BlockBased(BlockBasedFilterBlockReader::new(
                policy,
                prefix_extractor,
                whole_key_filtering,
                contents,
            )),
            FilterType::Full => {
                FilterBlockReader::Full(FullFilterBlockReader::new(policy, prefix_extractor, whole_key_filtering, contents))
            }
            FilterType::Partitioned => {
                FilterBlockReader::Partitioned(PartitionedFilterBlockReader::new(Block::new(contents)?, comparator))
            }
        })
    }

    /// Layout of this filter.
    pub fn filter_type(&self) -> FilterType {
        match self {
            FilterBlockReader::BlockBased(_) => FilterType::BlockBased,
            FilterBlockReader::Full(_) => FilterType::Full,
            FilterBlockReader::Partitioned(_) => FilterType::Partitioned,
        }
    }

    /// Heap bytes held by the reader.
    pub fn approximate_memory_usage(&self) -> usize {
        match self {
            FilterBlockReader::BlockBased(r) => r.approximate_memory_usage(),
            FilterBlockReader::Full(r) => r.approximate_memory_usage(),
            FilterBlockReader::Partitioned(r) => r.approximate_memory_usage(),
        }
    }
}
