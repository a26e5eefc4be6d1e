//! Configuration options for building and reading tables.

use crate::cache::{Cache, PersistentCache};
use crate::comparator::{BytewiseComparator, Comparator, SliceTransform};
use crate::filter::FilterPolicy;
use crate::sstable::flush_policy::{FlushBlockBySizePolicyFactory, FlushBlockPolicyFactory};
use crate::sstable::properties::TablePropertiesCollectorFactory;
use crate::statistics::Statistics;
use std::fmt;
use std::sync::Arc;

/// Compression algorithms understood by the table format.
///
/// The discriminants are the values stored in each block trailer. Every
/// variant is always recognised on read; a codec compiled out of this build
/// simply fails to compress or decompress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    Snappy = 1,

    /// LZ4 compression (very fast, lower compression ratio).
    Lz4 = 4,

    /// Zstandard compression, optionally with a dictionary.
    Zstd = 7,
}

impl CompressionType {
    /// Convert from the trailer byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            4 => Some(CompressionType::Lz4),
            7 => Some(CompressionType::Zstd),
            _ => None,
        }
    }

    /// Name recorded in `rocksdb.compression`.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "NoCompression",
            CompressionType::Snappy => "Snappy",
            CompressionType::Lz4 => "LZ4",
            CompressionType::Zstd => "ZSTD",
        }
    }

    /// Whether the codec for this type is compiled in.
    pub fn is_supported(&self) -> bool {
        match self {
            CompressionType::None => true,
            CompressionType::Snappy => cfg!(feature = "snappy"),
            CompressionType::Lz4 => cfg!(feature = "lz4-compression"),
            CompressionType::Zstd => cfg!(feature = "zstd-compression"),
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

/// Block checksum algorithm, stored once in the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksum. Not supported for reading or writing.
    NoChecksum = 0,
    /// Masked CRC32C.
    #[default]
    Crc32c = 1,
    /// 32-bit xxHash with seed 0.
    XxHash = 2,
}

impl ChecksumType {
    /// Convert from the footer byte.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ChecksumType::NoChecksum),
            1 => Some(ChecksumType::Crc32c),
            2 => Some(ChecksumType::XxHash),
            _ => None,
        }
    }
}

/// Index layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[repr(u32)]
pub enum IndexType {
    /// One index block searched with binary search.
    #[default]
    BinarySearch = 0,
    /// Binary search index plus a prefix hash for point lookups.
    HashSearch = 1,
    /// Top-level index over partitioned index blocks.
    TwoLevelIndexSearch = 2,
}

impl IndexType {
    /// Convert from the persisted property value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(IndexType::BinarySearch),
            1 => Some(IndexType::HashSearch),
            2 => Some(IndexType::TwoLevelIndexSearch),
            _ => None,
        }
    }
}

/// Placement of a table inside a fixed-size extent.
///
/// When set, the builder pads the table so its footer ends exactly at
/// `extent_size`, and the reader looks for the footer at that offset rather
/// than at end-of-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentOptions {
    /// Total size of the extent in bytes.
    pub extent_size: u64,
    /// Identifier of the next extent in the chain, recorded in the footer.
    pub next_extent: u64,
}

/// Options shared by [`TableBuilder`](crate::sstable::TableBuilder) and
/// [`TableReader`](crate::sstable::TableReader).
#[derive(Clone)]
pub struct TableOptions {
    /// Key order. Default: byte-wise.
    pub comparator: Arc<dyn Comparator>,

    /// Prefix extractor for prefix filtering and the hash index.
    pub prefix_extractor: Option<Arc<dyn SliceTransform>>,

    /// Decides where data blocks are cut.
    /// Default: [`FlushBlockBySizePolicyFactory`]
    pub flush_block_policy_factory: Arc<dyn FlushBlockPolicyFactory>,

    /// Target uncompressed data block size (in bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Percentage a block may deviate from `block_size` when deciding a cut.
    /// Default: 10
    pub block_size_deviation: usize,

    /// Entries between restart points in data blocks.
    /// Default: 16
    pub block_restart_interval: usize,

    /// Entries between restart points in index blocks.
    /// Default: 1
    pub index_block_restart_interval: usize,

    /// Prefix-compress keys inside data blocks.
    /// Default: true
    pub use_delta_encoding: bool,

    /// Index layout.
    /// Default: IndexType::BinarySearch
    pub index_type: IndexType,

    /// Target size for index and filter partitions (in bytes).
    /// Default: 4KB
    pub metadata_block_size: usize,

    /// Filter policy. `None` disables filters.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Cut filters in lock-step with index partitions.
    /// Requires `IndexType::TwoLevelIndexSearch`.
    /// Default: false
    pub partition_filters: bool,

    /// Add whole keys to the filter.
    /// Default: true
    pub whole_key_filtering: bool,

    /// Block checksum algorithm.
    /// Default: ChecksumType::Crc32c
    pub checksum: ChecksumType,

    /// Footer format version (0, 1 or 2).
    /// Default: 2
    pub format_version: u32,

    /// Compression algorithm for data and index blocks.
    /// Default: CompressionType::Snappy when the `snappy` feature is on
    pub compression: CompressionType,

    /// Compression level, used by zstd.
    /// Default: 3
    pub compression_level: i32,

    /// Dictionary for data block compression. Empty disables it.
    pub compression_dict: Vec<u8>,

    /// Blocks at or above this size are stored uncompressed.
    /// Default: i32::MAX
    pub compression_size_limit: usize,

    /// Decompress every compressed block right after compressing it.
    /// Default: false
    pub verify_compression: bool,

    /// Extent placement for the footer.
    pub extent: Option<ExtentOptions>,

    /// Cache for uncompressed blocks.
    pub block_cache: Option<Arc<dyn Cache>>,

    /// Cache for compressed blocks.
    pub block_cache_compressed: Option<Arc<dyn Cache>>,

    /// Secondary cache for raw block bytes.
    pub persistent_cache: Option<Arc<dyn PersistentCache>>,

    /// Keep index and filter blocks in `block_cache` instead of the reader.
    /// Default: false
    pub cache_index_and_filter_blocks: bool,

    /// Insert index and filter blocks with high priority.
    /// Default: false
    pub cache_index_and_filter_blocks_with_high_priority: bool,

    /// Hold the cache handles for index and filter for the reader's lifetime.
    /// Default: false
    pub pin_index_and_filter_blocks: bool,

    /// Load index and filter while opening.
    /// Default: true
    pub prefetch_index_and_filter: bool,

    /// Factories for user property collectors.
    pub table_properties_collector_factories: Vec<Arc<dyn TablePropertiesCollectorFactory>>,

    /// Merge operator name recorded in the properties.
    pub merge_operator_name: Option<String>,

    /// Column family id recorded in the properties.
    pub column_family_id: Option<u32>,

    /// Column family name recorded in the properties.
    pub column_family_name: Option<String>,

    /// Counters sink.
    pub statistics: Option<Arc<Statistics>>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            comparator: BytewiseComparator::shared(),
            prefix_extractor: None,
            flush_block_policy_factory: Arc::new(FlushBlockBySizePolicyFactory),
            block_size: 4 * 1024, // 4KB
            block_size_deviation: 10,
            block_restart_interval: 16,
            index_block_restart_interval: 1,
            use_delta_encoding: true,
            index_type: IndexType::BinarySearch,
            metadata_block_size: 4 * 1024, // 4KB
            filter_policy: None,
            partition_filters: false,
            whole_key_filtering: true,
            checksum: ChecksumType::Crc32c,
            format_version: 2,
            compression: CompressionType::default(),
            compression_level: 3,
            compression_dict: Vec::new(),
            compression_size_limit: i32::MAX as usize,
            verify_compression: false,
            extent: None,
            block_cache: None,
            block_cache_compressed: None,
            persistent_cache: None,
            cache_index_and_filter_blocks: false,
            cache_index_and_filter_blocks_with_high_priority: false,
            pin_index_and_filter_blocks: false,
            prefetch_index_and_filter: true,
            table_properties_collector_factories: Vec::new(),
            merge_operator_name: None,
            column_family_id: None,
            column_family_name: None,
            statistics: None,
        }
    }
}

impl fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableOptions")
            .field("comparator", &self.comparator.name())
            .field("prefix_extractor", &self.prefix_extractor.as_ref().map(|p| p.name().to_string()))
            .field("flush_block_policy", &self.flush_block_policy_factory.name())
            .field("block_size", &self.block_size)
            .field("block_size_deviation", &self.block_size_deviation)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("index_block_restart_interval", &self.index_block_restart_interval)
            .field("index_type", &self.index_type)
            .field("filter_policy", &self.filter_policy.as_ref().map(|p| p.name().to_string()))
            .field("partition_filters", &self.partition_filters)
            .field("whole_key_filtering", &self.whole_key_filtering)
            .field("checksum", &self.checksum)
            .field("format_version", &self.format_version)
            .field("compression", &self.compression)
            .field("extent", &self.extent)
            .field("block_cache", &self.block_cache.is_some())
            .field("block_cache_compressed", &self.block_cache_compressed.is_some())
            .field("cache_index_and_filter_blocks", &self.cache_index_and_filter_blocks)
            .field("pin_index_and_filter_blocks", &self.pin_index_and_filter_blocks)
            .finish_non_exhaustive()
    }
}

impl TableOptions {
    /// Creates a new TableOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key comparator.
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the prefix extractor.
    pub fn prefix_extractor(mut self, extractor: Arc<dyn SliceTransform>) -> Self {
        self.prefix_extractor = Some(extractor);
        self
    }

    /// Sets the target data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the allowed block size deviation percentage.
    pub fn block_size_deviation(mut self, percent: usize) -> Self {
        self.block_size_deviation = percent;
        self
    }

    /// Sets the data block restart interval.
    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    /// Sets the index layout.
    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    /// Sets the index and filter partition size.
    pub fn metadata_block_size(mut self, size: usize) -> Self {
        self.metadata_block_size = size;
        self
    }

    /// Sets the filter policy.
    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    /// Enables partitioned filters.
    pub fn partition_filters(mut self, value: bool) -> Self {
        self.partition_filters = value;
        self
    }

    /// Enables or disables whole key filtering.
    pub fn whole_key_filtering(mut self, value: bool) -> Self {
        self.whole_key_filtering = value;
        self
    }

    /// Sets the checksum algorithm.
    pub fn checksum(mut self, checksum: ChecksumType) -> Self {
        self.checksum = checksum;
        self
    }

    /// Sets the footer format version.
    pub fn format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Enables compression verification.
    pub fn verify_compression(mut self, value: bool) -> Self {
        self.verify_compression = value;
        self
    }

    /// Places the table in a fixed-size extent.
    pub fn extent(mut self, extent: ExtentOptions) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Sets the uncompressed block cache.
    pub fn block_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.block_cache = Some(cache);
        self
    }

    /// Sets the compressed block cache.
    pub fn block_cache_compressed(mut self, cache: Arc<dyn Cache>) -> Self {
        self.block_cache_compressed = Some(cache);
        self
    }

    /// Sets the persistent cache.
    pub fn persistent_cache(mut self, cache: Arc<dyn PersistentCache>) -> Self {
        self.persistent_cache = Some(cache);
        self
    }

    /// Keeps index and filter blocks in the block cache.
    pub fn cache_index_and_filter_blocks(mut self, value: bool) -> Self {
        self.cache_index_and_filter_blocks = value;
        self
    }

    /// Pins cached index and filter blocks for the reader's lifetime.
    pub fn pin_index_and_filter_blocks(mut self, value: bool) -> Self {
        self.pin_index_and_filter_blocks = value;
        self
    }

    /// Loads index and filter eagerly when opening.
    pub fn prefetch_index_and_filter(mut self, value: bool) -> Self {
        self.prefetch_index_and_filter = value;
        self
    }

    /// Registers a property collector factory.
    pub fn add_properties_collector(mut self, factory: Arc<dyn TablePropertiesCollectorFactory>) -> Self {
        self.table_properties_collector_factories.push(factory);
        self
    }

    /// Sets the statistics sink.
    pub fn statistics(mut self, statistics: Arc<Statistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.block_restart_interval == 0 || self.index_block_restart_interval == 0 {
            return Err(crate::Error::invalid_argument("restart intervals must be >= 1"));
        }
        if self.block_size_deviation > 100 {
            return Err(crate::Error::invalid_argument(
                "block_size_deviation must be between 0 and 100",
            ));
        }
        if self.metadata_block_size == 0 {
            return Err(crate::Error::invalid_argument("metadata_block_size must be > 0"));
        }
        if self.format_version > 2 {
            return Err(crate::Error::not_supported(format!(
                "format_version {} is not supported",
                self.format_version
            )));
        }
        if self.checksum == ChecksumType::NoChecksum {
            return Err(crate::Error::not_supported("tables without checksums"));
        }
        if self.index_type == IndexType::HashSearch && self.prefix_extractor.is_none() {
            return Err(crate::Error::invalid_argument(
                "hash index requires a prefix extractor",
            ));
        }
        if self.partition_filters && self.index_type != IndexType::TwoLevelIndexSearch {
            return Err(crate::Error::invalid_argument(
                "partition_filters requires the two-level index",
            ));
        }
        if let Some(extent) = &self.extent {
            if extent.extent_size == 0 {
                return Err(crate::Error::invalid_argument("extent_size must be > 0"));
            }
        }
        Ok(())
    }
}

/// Per-call read options.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Verify block checksums on every file read.
    /// Default: true
    pub verify_checksums: bool,

    /// Insert blocks read from file into the caches.
    /// Default: true
    pub fill_cache: bool,

    /// Ignore the prefix extractor: no prefix filtering, no hash lookups.
    /// Default: false
    pub total_order_seek: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { verify_checksums: true, fill_cache: true, total_order_seek: false }
    }
}

impl ReadOptions {
    /// Creates a new ReadOptions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables checksum verification.
    pub fn verify_checksums(mut self, value: bool) -> Self {
        self.verify_checksums = value;
        self
    }

    /// Enables or disables cache population.
    pub fn fill_cache(mut self, value: bool) -> Self {
        self.fill_cache = value;
        self
    }

    /// Enables or disables total order seeks.
    pub fn total_order_seek(mut self, value: bool) -> Self {
        self.total_order_seek = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::FixedPrefixTransform;

    #[test]
    fn test_default_options() {
        let opts = TableOptions::default();
        assert_eq!(opts.block_size, 4096);
        assert_eq!(opts.block_restart_interval, 16);
        assert_eq!(opts.index_block_restart_interval, 1);
        assert_eq!(opts.format_version, 2);
        assert_eq!(opts.checksum, ChecksumType::Crc32c);
        assert!(opts.whole_key_filtering);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let opts = TableOptions::new()
            .block_size(256)
            .index_type(IndexType::TwoLevelIndexSearch)
            .partition_filters(true)
            .compression(CompressionType::None);

        assert_eq!(opts.block_size, 256);
        assert_eq!(opts.index_type, IndexType::TwoLevelIndexSearch);
        assert!(opts.partition_filters);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = TableOptions::default();
        opts.block_size = 0;
        assert!(opts.validate().is_err());

        let opts = TableOptions::default().checksum(ChecksumType::NoChecksum);
        assert!(matches!(opts.validate(), Err(crate::Error::NotSupported(_))));

        let opts = TableOptions::default().index_type(IndexType::HashSearch);
        assert!(opts.validate().is_err());
        let opts = opts.prefix_extractor(Arc::new(FixedPrefixTransform::new(2)));
        assert!(opts.validate().is_ok());

        let opts = TableOptions::default().partition_filters(true);
        assert!(opts.validate().is_err());

        let opts = TableOptions::default().format_version(3);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_compression_type_wire_values() {
        assert_eq!(CompressionType::from_u8(0), Some(CompressionType::None));
        assert_eq!(CompressionType::from_u8(1), Some(CompressionType::Snappy));
        assert_eq!(CompressionType::from_u8(4), Some(CompressionType::Lz4));
        assert_eq!(CompressionType::from_u8(7), Some(CompressionType::Zstd));
        assert_eq!(CompressionType::from_u8(2), None);
        assert_eq!(CompressionType::Zstd.name(), "ZSTD");
        assert!(CompressionType::None.is_supported());
    }

    #[test]
    fn test_read_options_defaults() {
        let ro = ReadOptions::default();
        assert!(ro.verify_checksums);
        assert!(ro.fill_cache);
        assert!(!ro.total_order_seek);
    }
}
