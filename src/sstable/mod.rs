//! Block-based table implementation.
//!
//! A table is an immutable, sorted file of key-value pairs. The format is
//! designed for sequential writes and random reads.
//!
//! ## File Format
//!
//! ```text
//! [Data Block 1]
//! [Data Block 2]
//! ...
//! [Data Block N]
//! [Filter Block(s)]    // optional, partitions first
//! [Hash Index Blocks]  // optional
//! [Properties Block]
//! [Compression Dict]   // optional
//! [Range Del Block]    // optional
//! [Meta Index Block]   // name -> handle of each meta block
//! [Index Block(s)]     // partitions first, then the top level
//! [Footer]             // 48, 53 or 65 bytes
//! ```
//!
//! Every block is followed by a 5 byte trailer: the compression type and a
//! masked checksum over the block and the type byte.
//!
//! ## Block Format
//!
//! Each block contains:
//! - Prefix compressed key-value entries
//! - Restart points for binary search
//! - The number of restart points
//!
//! ## Index Format
//!
//! The index maps a separator `s` with `last key <= s < next block's first
//! key` to the handle of each data block. Large indexes are split into
//! partitions under a top-level index.

pub mod block;
pub mod builder;
pub mod flush_policy;
pub mod format;
pub mod index;
pub mod index_reader;
pub mod iterator;
pub mod meta_index;
pub mod properties;
pub mod reader;

pub use block::{Block, BlockBuilder, BlockIter};
pub use builder::TableBuilder;
pub use flush_policy::{FlushBlockBySizePolicy, FlushBlockBySizePolicyFactory, FlushBlockPolicy, FlushBlockPolicyFactory};
pub use format::{BlockContents, BlockHandle, Footer};
pub use iterator::InternalIterator;
pub use properties::{
    CompactOnDeletionCollectorFactory, TableProperties, TablePropertiesCollector, TablePropertiesCollectorFactory,
};
pub use reader::{TableIterator, TableReader};

// Re-export CompressionType from config
pub use crate::config::CompressionType;

/// Default block size (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
