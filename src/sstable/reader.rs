//! Table reader.
//!
//! Opens a table file and serves point lookups and iteration. Everything
//! decoded at open time is immutable afterwards, so a [`TableReader`] can be
//! shared across threads; only the caches it talks to mutate.

use crate::cache::{CachableEntry, Cache, CacheValue, Priority};
use crate::coding::put_varint64;
use crate::comparator::{Comparator, SliceTransform};
use crate::compression;
use crate::config::{ChecksumType, CompressionType, IndexType, ReadOptions, TableOptions};
use crate::error::{Error, Result};
use crate::file::{FileReader, RandomAccessFile};
use crate::filter::{FilterBlockReader, FilterPolicy, FilterType, FullFilterBlockReader};
use crate::sstable::block::Block;
use crate::sstable::format::{
    cache_key, read_block_contents, read_footer_from_file, BlockContents, BlockFetchContext, BlockHandle, Footer,
};
use crate::sstable::index_reader::{HashPrefixIndex, IndexIterator, IndexReader};
use crate::sstable::iterator::{BlockFetcher, InternalIterator, TwoLevelIterator};
use crate::sstable::meta_index::{
    MetaIndex, COMPRESSION_DICT_BLOCK, HASH_INDEX_PREFIXES_BLOCK, HASH_INDEX_PREFIXES_METADATA_BLOCK,
    PROPERTIES_BLOCK, RANGE_DEL_BLOCK,
};
use crate::sstable::properties::TableProperties;
use crate::statistics::{record_tick, Statistics, Ticker};
use bytes::Bytes;
use std::cmp::Ordering;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Iterator over the entries of a table, in key order.
pub type TableIterator = TwoLevelIterator<IndexIterator<IndexPartitionFetcher>, DataBlockFetcher>;

/// TableReader provides read access to a table file.
///
/// Usage:
/// ```no_run
/// use blocktable::config::{ReadOptions, TableOptions};
/// use blocktable::sstable::TableReader;
///
/// let reader = TableReader::open_path("table.sst", TableOptions::default()).unwrap();
/// if let Some(value) = reader.get(&ReadOptions::default(), b"key1").unwrap() {
///     println!("Found: {:?}", value);
/// }
/// ```
#[derive(Clone)]
pub struct TableReader {
    rep: Arc<Rep>,
}

struct FilterInfo {
    filter_type: FilterType,
    handle: BlockHandle,
    policy: Arc<dyn FilterPolicy>,
}

struct Rep {
    options: TableOptions,
    file: Arc<dyn RandomAccessFile>,
    file_size: u64,
    footer: Footer,
    meta_index: MetaIndex,
    properties: TableProperties,
    cache_key_prefix: Vec<u8>,
    compressed_cache_key_prefix: Vec<u8>,
    persistent_cache_key_prefix: Vec<u8>,
    compression_dict: Bytes,
    index_type: IndexType,
    filter: Option<FilterInfo>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    range_del_handle: Option<BlockHandle>,
    /// Set when the index is owned by the reader or pinned in the cache.
    index: OnceLock<CachableEntry<Arc<IndexReader>>>,
    /// Same as `index`, for the filter.
    filter_reader: OnceLock<CachableEntry<Arc<FilterBlockReader>>>,
}

/// Kinds of blocks loaded through the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Data,
    IndexPartition,
}

impl BlockKind {
    fn tickers(self) -> (Ticker, Ticker) {
        match self {
            BlockKind::Data => (Ticker::BlockCacheDataHit, Ticker::BlockCacheDataMiss),
            BlockKind::IndexPartition => (Ticker::BlockCacheIndexHit, Ticker::BlockCacheIndexMiss),
        }
    }
}

/// Key prefix for one cache tier: the file's own id when it has one, else
/// `new_id` drawn from the tier so that no two readers share keys.
fn generate_cache_prefix(file: &dyn RandomAccessFile, new_id: Option<u64>) -> Vec<u8> {
    match (file.unique_id(), new_id) {
        (Some(id), _) => id,
        (None, Some(new_id)) => {
            let mut prefix = Vec::new();
            put_varint64(&mut prefix, new_id);
            prefix
        }
        (None, None) => Vec::new(),
    }
}

fn read_meta_block(ctx: &BlockFetchContext<'_>, handle: &BlockHandle) -> Result<Block> {
    Block::new(read_block_contents(ctx, handle, true)?.data)
}

impl TableReader {
    /// Open the table file at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P, options: TableOptions) -> Result<Self> {
        let file = FileReader::open(path)?;
        let file_size = file.size()?;
        Self::open(options, Arc::new(file), file_size)
    }

    /// Open a table of `file_size` bytes. With [`TableOptions::extent`] set,
    /// the footer is read at the end of the extent.
    pub fn open(options: TableOptions, file: Arc<dyn RandomAccessFile>, file_size: u64) -> Result<Self> {
        options.validate()?;
        let extent_size = options.extent.map(|e| e.extent_size);
        let footer = read_footer_from_file(file.as_ref(), file_size, extent_size)?;
        if footer.checksum == ChecksumType::NoChecksum {
            return Err(Error::not_supported("tables without checksums"));
        }

        let cache_key_prefix = generate_cache_prefix(file.as_ref(), options.block_cache.as_ref().map(|c| c.new_id()));
        let compressed_cache_key_prefix =
            generate_cache_prefix(file.as_ref(), options.block_cache_compressed.as_ref().map(|c| c.new_id()));
        let persistent_cache_key_prefix =
            generate_cache_prefix(file.as_ref(), options.persistent_cache.as_ref().map(|c| c.new_id()));

        let ctx = BlockFetchContext {
            file: file.as_ref(),
            checksum: footer.checksum,
            verify_checksums: true,
            persistent_cache: options.persistent_cache.as_deref(),
            cache_key_prefix: &persistent_cache_key_prefix,
            compression_dict: &[],
            statistics: options.statistics.as_deref(),
        };

        let meta_index = MetaIndex::from_block(&read_meta_block(&ctx, &footer.metaindex_handle)?)?;

        let properties = match meta_index.find(PROPERTIES_BLOCK) {
            Some(handle) => match read_meta_block(&ctx, &handle).and_then(|b| TableProperties::decode(&b)) {
                Ok(props) => props,
                Err(e) => {
                    log::warn!("Encountered error while reading data from properties block {}", e);
                    TableProperties::default()
                }
            },
            None => {
                log::warn!("Cannot find Properties block from file.");
                TableProperties::default()
            }
        };

        let compression_dict = match meta_index.find(COMPRESSION_DICT_BLOCK) {
            Some(handle) => read_block_contents(&ctx, &handle, false)?.data,
            None => Bytes::new(),
        };

        let prefix_extractor = match &options.prefix_extractor {
            Some(extractor)
                if properties.prefix_extractor_name.is_empty()
                    || properties.prefix_extractor_name == extractor.name() =>
            {
                Some(extractor.clone())
            }
            Some(extractor) => {
                log::info!(
                    "Prefix extractor {} does not match {} used to build the table; prefix filtering disabled",
                    extractor.name(),
                    properties.prefix_extractor_name
                );
                None
            }
            None => None,
        };

        let mut index_type = properties.index_type().unwrap_or(options.index_type);
        if index_type == IndexType::HashSearch
            && (prefix_extractor.is_none() || meta_index.find(HASH_INDEX_PREFIXES_BLOCK).is_none())
        {
            log::warn!("Missing prefix extractor or prefix map for hash index. Fall back to binary search index.");
            index_type = IndexType::BinarySearch;
        }

        let filter = options.filter_policy.as_ref().and_then(|policy| {
            [FilterType::Full, FilterType::Partitioned, FilterType::BlockBased].into_iter().find_map(|filter_type| {
                meta_index.find(&filter_type.meta_key(policy.as_ref())).map(|handle| FilterInfo {
                    filter_type,
                    handle,
                    policy: policy.clone(),
                })
            })
        });

        let range_del_handle = meta_index.find(RANGE_DEL_BLOCK);
        let whole_key_filtering = properties.whole_key_filtering();

        let reader = Self {
            rep: Arc::new(Rep {
                file,
                file_size,
                footer,
                meta_index,
                properties,
                cache_key_prefix,
                compressed_cache_key_prefix,
                persistent_cache_key_prefix,
                compression_dict,
                index_type,
                filter,
                prefix_extractor,
                whole_key_filtering,
                range_del_handle,
                index: OnceLock::new(),
                filter_reader: OnceLock::new(),
                options,
            }),
        };

        if reader.rep.options.prefetch_index_and_filter {
            // Owned or pinned readers stay in the rep; otherwise this only
            // warms the block cache.
            reader.rep.index_reader()?;
            reader.rep.filter_entry();
        }
        Ok(reader)
    }

    /// Get the value for a key.
    pub fn get(&self, read_options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let comparator = self.rep.options.comparator.clone();
        let mut found = None;
        self.get_with(read_options, key, |k, v| {
            if comparator.compare(k, key) == Ordering::Equal {
                found = Some(v.to_vec());
            }
            false
        })?;
        Ok(found)
    }

    /// Visits the entries at or after `key` in key order until `visitor`
    /// returns false. Stops early when a filter rules `key` out.
    pub fn get_with<F>(&self, read_options: &ReadOptions, key: &[u8], mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let rep = &self.rep;
        let filter = rep.filter_entry();
        if let Some(filter) = &filter {
            if !rep.full_filter_key_may_match(filter, key, read_options) {
                record_tick(rep.statistics(), Ticker::BloomFilterUseful, 1);
                return Ok(());
            }
        }

        let index = rep.index_reader()?;
        let mut index_iter = index.new_iterator(
            IndexPartitionFetcher { rep: rep.clone(), read_options: *read_options },
            read_options.total_order_seek,
        );
        index_iter.seek(key);
        while index_iter.valid() {
            let handle = BlockHandle::decode(index_iter.value())?;

            if let Some(FilterBlockReader::BlockBased(block_filter)) = filter.as_deref() {
                if !block_filter.key_may_match(key, handle.offset()) {
                    // The key can only be in this block.
                    record_tick(rep.statistics(), Ticker::BloomFilterUseful, 1);
                    break;
                }
            }

            let block = rep.retrieve_block(read_options, &handle, BlockKind::Data)?;
            let mut block_iter = block.iter(rep.options.comparator.clone());
            block_iter.seek(key);
            let mut done = false;
            while block_iter.valid() {
                if !visitor(block_iter.key(), block_iter.value()) {
                    done = true;
                    break;
                }
                block_iter.next();
            }
            block_iter.status()?;
            if done {
                break;
            }
            index_iter.next();
        }
        index_iter.status()
    }

    /// Iterator over every entry.
    ///
    /// Unless `total_order_seek` is set, seeks may skip to the end when the
    /// target's prefix is absent from the table; only keys sharing the
    /// target's prefix are then guaranteed to be found.
    pub fn iter(&self, read_options: &ReadOptions) -> Result<TableIterator> {
        let rep = &self.rep;
        let index = rep.index_reader()?;
        let index_iter = index.new_iterator(
            IndexPartitionFetcher { rep: rep.clone(), read_options: *read_options },
            read_options.total_order_seek,
        );
        let filter = rep.filter_entry();
        Ok(TwoLevelIterator::new(
            index_iter,
            DataBlockFetcher { rep: rep.clone(), read_options: *read_options, filter },
        ))
    }

    /// Approximate file offset of the data for `key`. Keys past the last
    /// entry map to the offset of the meta blocks.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let rep = &self.rep;
        let past_end = rep.footer.metaindex_handle.offset();
        let index = match rep.index_reader() {
            Ok(index) => index,
            Err(e) => {
                log::warn!("Cannot load index for offset estimate: {}", e);
                return past_end;
            }
        };
        let read_options = ReadOptions::default().fill_cache(false);
        let mut iter = index.new_iterator(IndexPartitionFetcher { rep: rep.clone(), read_options }, true);
        iter.seek(key);
        if !iter.valid() {
            return past_end;
        }
        BlockHandle::decode(iter.value()).map(|h| h.offset()).unwrap_or(past_end)
    }

    /// Loads the data blocks covering `[begin, end]` into the block cache.
    /// `None` bounds are open.
    pub fn prefetch(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let rep = &self.rep;
        let comparator = rep.options.comparator.clone();
        if let (Some(begin), Some(end)) = (begin, end) {
            if comparator.compare(begin, end) == Ordering::Greater {
                return Err(Error::invalid_argument("prefetch range begins after it ends"));
            }
        }

        let read_options = ReadOptions::default();
        let index = rep.index_reader()?;
        let mut iter = index.new_iterator(IndexPartitionFetcher { rep: rep.clone(), read_options }, true);
        match begin {
            Some(begin) => iter.seek(begin),
            None => iter.seek_to_first(),
        }
        while iter.valid() {
            // The block holding `end` is loaded too.
            let boundary = end.is_some_and(|end| comparator.compare(iter.key(), end) != Ordering::Less);
            let handle = BlockHandle::decode(iter.value())?;
            rep.retrieve_block(&read_options, &handle, BlockKind::Data)?;
            if boundary {
                break;
            }
            iter.next();
        }
        iter.status()
    }

    /// Range deletions stored in the table, as `(begin, end)` pairs.
    pub fn range_tombstones(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(handle) = self.rep.range_del_handle else {
            return Ok(Vec::new());
        };
        let block = read_meta_block(&self.rep.fetch_context(true), &handle)?;
        let mut iter = block.iter(self.rep.options.comparator.clone());
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        iter.status()?;
        Ok(out)
    }

    /// Whether the data block that would hold `key` is in the block cache.
    pub fn block_in_cache(&self, key: &[u8]) -> Result<bool> {
        let rep = &self.rep;
        let Some(cache) = &rep.options.block_cache else {
            return Ok(false);
        };
        let index = rep.index_reader()?;
        let read_options = ReadOptions::default().fill_cache(false);
        let mut iter = index.new_iterator(IndexPartitionFetcher { rep: rep.clone(), read_options }, true);
        iter.seek(key);
        iter.status()?;
        if !iter.valid() {
            return Ok(false);
        }
        let handle = BlockHandle::decode(iter.value())?;
        match cache.lookup(&cache_key(&rep.cache_key_prefix, handle.offset())) {
            Some(cache_handle) => {
                cache.release(cache_handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reads every block referenced by the meta-index and the index straight
    /// from the file, verifying its checksum.
    pub fn verify_checksums(&self) -> Result<()> {
        let rep = &self.rep;
        let ctx = rep.fetch_context(true);
        for (name, handle) in rep.meta_index.iter() {
            read_block_contents(&ctx, handle, false).map_err(|e| {
                log::error!("Meta block {} failed verification: {}", name, e);
                e
            })?;
        }

        let read_options = ReadOptions::default().fill_cache(false);
        let index = rep.index_reader()?;
        let mut iter = index.new_iterator(IndexPartitionFetcher { rep: rep.clone(), read_options }, true);
        iter.seek_to_first();
        while iter.valid() {
            let handle = BlockHandle::decode(iter.value())?;
            read_block_contents(&ctx, &handle, false)?;
            iter.next();
        }
        iter.status()
    }

    /// Writes a human readable description of the whole table to `out`.
    pub fn dump_table<W: Write>(&self, out: &mut W) -> Result<()> {
        let rep = &self.rep;
        writeln!(out, "Footer Details:")?;
        writeln!(out, "--------------------------------------")?;
        writeln!(out, "  metaindex handle: {}", rep.footer.metaindex_handle)?;
        writeln!(out, "  index handle: {}", rep.footer.index_handle)?;
        writeln!(out, "  table_magic_number: {:#x}", rep.footer.table_magic_number)?;
        writeln!(out, "  format version: {}", rep.footer.version)?;
        writeln!(out, "  checksum: {:?}", rep.footer.checksum)?;
        if rep.footer.is_extent() {
            writeln!(out, "  valid size: {}", rep.footer.valid_size)?;
            writeln!(out, "  next extent: {}", rep.footer.next_extent)?;
        }

        writeln!(out, "\nMetaindex Details:")?;
        writeln!(out, "--------------------------------------")?;
        for (name, handle) in rep.meta_index.iter() {
            writeln!(out, "  {}: {}", name, handle)?;
        }

        writeln!(out, "\nTable Properties:")?;
        writeln!(out, "--------------------------------------")?;
        writeln!(out, "{}", rep.properties.to_json()?)?;

        if let Some(filter) = rep.filter_entry() {
            writeln!(out, "\nFilter Details:")?;
            writeln!(out, "--------------------------------------")?;
            writeln!(out, "  type: {:?}", filter.filter_type())?;
            writeln!(out, "  memory: {} bytes", filter.approximate_memory_usage())?;
        }

        let read_options = ReadOptions::default().fill_cache(false);
        let index = rep.index_reader()?;
        writeln!(out, "\nIndex Details:")?;
        writeln!(out, "--------------------------------------")?;
        writeln!(out, "  type: {:?}", index.index_type())?;
        let mut index_iter = index.new_iterator(IndexPartitionFetcher { rep: rep.clone(), read_options }, true);
        index_iter.seek_to_first();
        while index_iter.valid() {
            let handle = BlockHandle::decode(index_iter.value())?;
            writeln!(out, "  {} -> {}", escape(index_iter.key()), handle)?;
            index_iter.next();
        }
        index_iter.status()?;

        writeln!(out, "\nData Block Details:")?;
        writeln!(out, "--------------------------------------")?;
        let mut iter = self.iter(&read_options.total_order_seek(true))?;
        iter.seek_to_first();
        while iter.valid() {
            writeln!(out, "  {} => {}", escape(iter.key()), escape(iter.value()))?;
            iter.next();
        }
        iter.status()?;

        let tombstones = self.range_tombstones()?;
        if !tombstones.is_empty() {
            writeln!(out, "\nRange Deletions:")?;
            writeln!(out, "--------------------------------------")?;
            for (begin, end) in tombstones {
                writeln!(out, "  [{}, {})", escape(&begin), escape(&end))?;
            }
        }
        Ok(())
    }

    /// The decoded footer.
    pub fn footer(&self) -> &Footer {
        &self.rep.footer
    }

    /// Properties read from the table. Defaults when the block is missing
    /// or unreadable.
    pub fn table_properties(&self) -> &TableProperties {
        &self.rep.properties
    }

    /// Index layout in use.
    pub fn index_type(&self) -> IndexType {
        self.rep.index_type
    }

    /// Filter layout in use, if a filter matching the configured policy
    /// exists.
    pub fn filter_type(&self) -> Option<FilterType> {
        self.rep.filter.as_ref().map(|f| f.filter_type)
    }

    /// Size of the table file.
    pub fn file_size(&self) -> u64 {
        self.rep.file_size
    }

    /// Memory held by the index and filter when owned by the reader rather
    /// than the block cache.
    pub fn approximate_memory_usage(&self) -> usize {
        let rep = &self.rep;
        let index = rep.index.get().filter(|e| !e.is_cached()).map_or(0, |e| e.approximate_memory_usage());
        let filter = rep.filter_reader.get().filter(|e| !e.is_cached()).map_or(0, |e| e.approximate_memory_usage());
        index + filter
    }
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("file_size", &self.rep.file_size)
            .field("footer", &self.rep.footer)
            .field("index_type", &self.rep.index_type)
            .finish_non_exhaustive()
    }
}

fn escape(data: &[u8]) -> String {
    data.escape_ascii().to_string()
}

impl Rep {
    fn statistics(&self) -> Option<&Statistics> {
        self.options.statistics.as_deref()
    }

    fn fetch_context(&self, verify_checksums: bool) -> BlockFetchContext<'_> {
        BlockFetchContext {
            file: self.file.as_ref(),
            checksum: self.footer.checksum,
            verify_checksums,
            persistent_cache: self.options.persistent_cache.as_deref(),
            cache_key_prefix: &self.persistent_cache_key_prefix,
            compression_dict: &self.compression_dict,
            statistics: self.statistics(),
        }
    }

    fn meta_cache(&self) -> Option<&Arc<dyn Cache>> {
        if self.options.cache_index_and_filter_blocks {
            self.options.block_cache.as_ref()
        } else {
            None
        }
    }

    fn meta_priority(&self) -> Priority {
        if self.options.cache_index_and_filter_blocks_with_high_priority {
            Priority::High
        } else {
            Priority::Low
        }
    }

    /// Looks `offset` up in `cache`, loading and inserting on a miss. A
    /// failed insert hands out an uncached value.
    fn lookup_or_load<T: Clone>(
        &self,
        cache: &Arc<dyn Cache>,
        offset: u64,
        (hit, miss): (Ticker, Ticker),
        unpack: impl Fn(&CacheValue) -> Option<T>,
        load: impl FnOnce() -> Result<(T, CacheValue, usize)>,
    ) -> Result<CachableEntry<T>> {
        let key = cache_key(&self.cache_key_prefix, offset);
        if let Some(handle) = cache.lookup(&key) {
            if let Some(value) = unpack(handle.value()) {
                record_tick(self.statistics(), hit, 1);
                return Ok(CachableEntry::cached(value, cache.clone(), handle));
            }
            cache.release(handle);
        }
        record_tick(self.statistics(), miss, 1);

        let (value, cache_value, charge) = load()?;
        match cache.insert(&key, cache_value, charge, self.meta_priority()) {
            Ok(handle) => {
                record_tick(self.statistics(), Ticker::BlockCacheAdd, 1);
                Ok(CachableEntry::cached(value, cache.clone(), handle))
            }
            Err(e) => {
                record_tick(self.statistics(), Ticker::BlockCacheAddFailures, 1);
                log::warn!("Block cache insert failed, serving uncached: {}", e);
                Ok(CachableEntry::owned(value))
            }
        }
    }

    fn index_reader(&self) -> Result<Arc<IndexReader>> {
        if let Some(entry) = self.index.get() {
            return Ok(entry.value().clone());
        }
        let entry = match self.meta_cache() {
            Some(cache) => self.lookup_or_load(
                cache,
                self.footer.index_handle.offset(),
                (Ticker::BlockCacheIndexHit, Ticker::BlockCacheIndexMiss),
                |value| match value {
                    CacheValue::Index(reader) => Some(reader.clone()),
                    _ => None,
                },
                || {
                    let reader = Arc::new(self.create_index_reader()?);
                    let charge = reader.approximate_memory_usage();
                    Ok((reader.clone(), CacheValue::Index(reader), charge))
                },
            )?,
            None => CachableEntry::owned(Arc::new(self.create_index_reader()?)),
        };

        let reader = entry.value().clone();
        // Cached entries are only kept when pinned; otherwise the handle is
        // released on return.
        if !entry.is_cached() || self.options.pin_index_and_filter_blocks {
            let _ = self.index.set(entry);
        }
        Ok(reader)
    }

    fn create_index_reader(&self) -> Result<IndexReader> {
        let ctx = self.fetch_context(true);
        let block = read_meta_block(&ctx, &self.footer.index_handle)?;
        let comparator = self.options.comparator.clone();
        Ok(match self.index_type {
            IndexType::BinarySearch => IndexReader::Binary { block, comparator },
            IndexType::TwoLevelIndexSearch => IndexReader::Partitioned { top_level: block, comparator },
            IndexType::HashSearch => match self.load_hash_prefix_index(&ctx) {
                Ok(prefix_index) => IndexReader::Hash { block, comparator, prefix_index: Arc::new(prefix_index) },
                Err(e) => {
                    log::warn!("Unable to read the metaindex for hash index. Fall back to binary search index: {}", e);
                    IndexReader::Binary { block, comparator }
                }
            },
        })
    }

    fn load_hash_prefix_index(&self, ctx: &BlockFetchContext<'_>) -> Result<HashPrefixIndex> {
        let extractor = self.prefix_extractor.clone().ok_or_else(|| Error::not_found("prefix extractor"))?;
        let prefixes = self
            .meta_index
            .find(HASH_INDEX_PREFIXES_BLOCK)
            .ok_or_else(|| Error::not_found(HASH_INDEX_PREFIXES_BLOCK))?;
        let metadata = self
            .meta_index
            .find(HASH_INDEX_PREFIXES_METADATA_BLOCK)
            .ok_or_else(|| Error::not_found(HASH_INDEX_PREFIXES_METADATA_BLOCK))?;
        let prefixes = read_block_contents(ctx, &prefixes, true)?;
        let metadata = read_block_contents(ctx, &metadata, true)?;
        HashPrefixIndex::decode(extractor, &prefixes.data, &metadata.data)
    }

    /// The filter, if any. Load failures are logged and treated as no filter.
    fn filter_entry(&self) -> Option<Arc<FilterBlockReader>> {
        let info = self.filter.as_ref()?;
        if let Some(entry) = self.filter_reader.get() {
            return Some(entry.value().clone());
        }
        let entry = match self.meta_cache() {
            Some(cache) => self.lookup_or_load(
                cache,
                info.handle.offset(),
                (Ticker::BlockCacheFilterHit, Ticker::BlockCacheFilterMiss),
                |value| match value {
                    CacheValue::Filter(reader) => Some(reader.clone()),
                    _ => None,
                },
                || {
                    let reader = Arc::new(self.create_filter_reader(info.filter_type, &info.handle)?);
                    let charge = reader.approximate_memory_usage();
                    Ok((reader.clone(), CacheValue::Filter(reader), charge))
                },
            ),
            None => self.create_filter_reader(info.filter_type, &info.handle).map(|r| CachableEntry::owned(Arc::new(r))),
        };

        match entry {
            Ok(entry) => {
                let reader = entry.value().clone();
                if !entry.is_cached() || self.options.pin_index_and_filter_blocks {
                    let _ = self.filter_reader.set(entry);
                }
                Some(reader)
            }
            Err(e) => {
                log::warn!("Error reading filter block at {}: {}", info.handle, e);
                None
            }
        }
    }

    fn create_filter_reader(&self, filter_type: FilterType, handle: &BlockHandle) -> Result<FilterBlockReader> {
        let info = self.filter.as_ref().ok_or_else(|| Error::invalid_state("table has no filter"))?;
        let contents = read_block_contents(&self.fetch_context(true), handle, true)?;
        FilterBlockReader::new(
            filter_type,
            contents.data,
            info.policy.clone(),
            self.prefix_extractor.clone(),
            self.whole_key_filtering,
            self.options.comparator.clone(),
        )
    }

    /// One partition of a partitioned filter.
    fn filter_partition(&self, handle: &BlockHandle) -> Result<Arc<FilterBlockReader>> {
        match self.meta_cache() {
            Some(cache) => {
                let entry = self.lookup_or_load(
                    cache,
                    handle.offset(),
                    (Ticker::BlockCacheFilterHit, Ticker::BlockCacheFilterMiss),
                    |value| match value {
                        CacheValue::Filter(reader) => Some(reader.clone()),
                        _ => None,
                    },
                    || {
                        let reader = Arc::new(self.create_filter_reader(FilterType::Full, handle)?);
                        let charge = reader.approximate_memory_usage();
                        Ok((reader.clone(), CacheValue::Filter(reader), charge))
                    },
                )?;
                Ok(entry.value().clone())
            }
            None => Ok(Arc::new(self.create_filter_reader(FilterType::Full, handle)?)),
        }
    }

    fn full_filter_reader_may_match(&self, reader: &FullFilterBlockReader, key: &[u8], read_options: &ReadOptions) -> bool {
        if self.whole_key_filtering {
            return reader.key_may_match(key);
        }
        match &self.prefix_extractor {
            Some(extractor) if !read_options.total_order_seek && extractor.in_domain(key) => {
                reader.prefix_may_match(extractor.transform(key))
            }
            _ => true,
        }
    }

    /// Whole-table filter probe for a point lookup.
    fn full_filter_key_may_match(&self, filter: &FilterBlockReader, key: &[u8], read_options: &ReadOptions) -> bool {
        match filter {
            FilterBlockReader::BlockBased(_) => true,
            FilterBlockReader::Full(reader) => self.full_filter_reader_may_match(reader, key, read_options),
            FilterBlockReader::Partitioned(top_level) => {
                let handle = match top_level.partition_for(key) {
                    Ok(Some(handle)) => handle,
                    // Past the last partition: past the last key.
                    Ok(None) => return false,
                    Err(e) => {
                        log::warn!("Error reading filter partition index: {}", e);
                        return true;
                    }
                };
                match self.filter_partition(&handle) {
                    Ok(partition) => match partition.as_ref() {
                        FilterBlockReader::Full(reader) => self.full_filter_reader_may_match(reader, key, read_options),
                        _ => true,
                    },
                    Err(e) => {
                        log::warn!("Error reading filter partition at {}: {}", handle, e);
                        true
                    }
                }
            }
        }
    }

    /// Whether keys sharing the prefix of `target` may exist at or after it.
    fn prefix_may_match(&self, filter: Option<&FilterBlockReader>, target: &[u8], read_options: &ReadOptions) -> bool {
        if read_options.total_order_seek {
            return true;
        }
        let (Some(extractor), Some(filter)) = (&self.prefix_extractor, filter) else {
            return true;
        };
        if !extractor.in_domain(target) {
            return true;
        }
        let prefix = extractor.transform(target);

        let may_match = match filter {
            FilterBlockReader::BlockBased(_) => true,
            FilterBlockReader::Full(reader) => reader.prefix_may_match(prefix),
            FilterBlockReader::Partitioned(top_level) => {
                // The first key at or after `target` is in the partition
                // covering it or starts the next one.
                match top_level.partitions_from(target, 2) {
                    Ok(handles) => handles.iter().any(|handle| match self.filter_partition(handle) {
                        Ok(partition) => match partition.as_ref() {
                            FilterBlockReader::Full(reader) => reader.prefix_may_match(prefix),
                            _ => true,
                        },
                        Err(e) => {
                            log::warn!("Error reading filter partition at {}: {}", handle, e);
                            true
                        }
                    }),
                    Err(e) => {
                        log::warn!("Error reading filter partition index: {}", e);
                        true
                    }
                }
            }
        };
        if !may_match {
            record_tick(self.statistics(), Ticker::BloomFilterPrefixUseful, 1);
        }
        may_match
    }

    fn lookup_compressed(&self, handle: &BlockHandle) -> Option<BlockContents> {
        let cache = self.options.block_cache_compressed.as_ref()?;
        let key = cache_key(&self.compressed_cache_key_prefix, handle.offset());
        let Some(cache_handle) = cache.lookup(&key) else {
            record_tick(self.statistics(), Ticker::BlockCacheCompressedMiss, 1);
            return None;
        };
        let contents = match cache_handle.value() {
            CacheValue::Compressed(contents) => Some(contents.clone()),
            _ => None,
        };
        cache.release(cache_handle);
        if contents.is_some() {
            record_tick(self.statistics(), Ticker::BlockCacheCompressedHit, 1);
        }
        contents
    }

    /// Loads a block through the block cache, then the compressed block
    /// cache, then the file. Levels that missed are filled on the way back
    /// when `fill_cache` is set.
    fn retrieve_block(&self, read_options: &ReadOptions, handle: &BlockHandle, kind: BlockKind) -> Result<CachableEntry<Block>> {
        let (hit, miss) = kind.tickers();
        let block_cache = self.options.block_cache.as_ref();
        let key = block_cache.map(|_| cache_key(&self.cache_key_prefix, handle.offset()));

        if let (Some(cache), Some(key)) = (block_cache, &key) {
            if let Some(cache_handle) = cache.lookup(key) {
                if let CacheValue::Block(block) = cache_handle.value() {
                    let block = block.clone();
                    record_tick(self.statistics(), hit, 1);
                    return Ok(CachableEntry::cached(block, cache.clone(), cache_handle));
                }
                cache.release(cache_handle);
            }
            record_tick(self.statistics(), miss, 1);
        }

        let contents = match self.lookup_compressed(handle) {
            Some(contents) => contents,
            None => {
                let compressed_cache = self.options.block_cache_compressed.as_ref();
                let ctx = self.fetch_context(read_options.verify_checksums);
                let contents = read_block_contents(&ctx, handle, compressed_cache.is_none())?;
                if let Some(cache) = compressed_cache {
                    if read_options.fill_cache && contents.compression_type != CompressionType::None {
                        let key = cache_key(&self.compressed_cache_key_prefix, handle.offset());
                        let charge = contents.data.len();
                        match cache.insert(&key, CacheValue::Compressed(contents.clone()), charge, Priority::Low) {
                            Ok(cache_handle) => cache.release(cache_handle),
                            Err(e) => log::warn!("Compressed block cache insert failed: {}", e),
                        }
                    }
                }
                contents
            }
        };

        let data = if contents.compression_type == CompressionType::None {
            contents.data
        } else {
            let raw = compression::decompress(contents.compression_type, &contents.data, &self.compression_dict)?;
            record_tick(self.statistics(), Ticker::BlockDecompressed, 1);
            Bytes::from(raw)
        };
        let block = Block::new(data)?;

        match (block_cache, key) {
            (Some(cache), Some(key)) if read_options.fill_cache => {
                match cache.insert(&key, CacheValue::Block(block.clone()), block.size(), Priority::Low) {
                    Ok(cache_handle) => {
                        record_tick(self.statistics(), Ticker::BlockCacheAdd, 1);
                        Ok(CachableEntry::cached(block, cache.clone(), cache_handle))
                    }
                    Err(e) => {
                        record_tick(self.statistics(), Ticker::BlockCacheAddFailures, 1);
                        log::warn!("Block cache insert failed for {}: {}", handle, e);
                        Ok(CachableEntry::owned(block))
                    }
                }
            }
            _ => Ok(CachableEntry::owned(block)),
        }
    }
}

/// Loads index partitions for a two-level index.
pub struct IndexPartitionFetcher {
    rep: Arc<Rep>,
    read_options: ReadOptions,
}

impl BlockFetcher for IndexPartitionFetcher {
    fn fetch_block(&self, handle_value: &[u8]) -> Result<CachableEntry<Block>> {
        let handle = BlockHandle::decode(handle_value)?;
        self.rep.retrieve_block(&self.read_options, &handle, BlockKind::IndexPartition)
    }

    fn comparator(&self) -> Arc<dyn Comparator> {
        self.rep.options.comparator.clone()
    }
}

/// Loads data blocks for a [`TableIterator`].
pub struct DataBlockFetcher {
    rep: Arc<Rep>,
    read_options: ReadOptions,
    filter: Option<Arc<FilterBlockReader>>,
}

impl BlockFetcher for DataBlockFetcher {
    fn fetch_block(&self, handle_value: &[u8]) -> Result<CachableEntry<Block>> {
        let handle = BlockHandle::decode(handle_value)?;
        self.rep.retrieve_block(&self.read_options, &handle, BlockKind::Data)
    }

    fn comparator(&self) -> Arc<dyn Comparator> {
        self.rep.options.comparator.clone()
    }

    fn prefix_may_match(&self, target: &[u8]) -> bool {
        self.rep.prefix_may_match(self.filter.as_deref(), target, &self.read_options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::comparator::FixedPrefixTransform;
    use crate::file::MemFile;
    use crate::filter::BloomFilterPolicy;
    use crate::sstable::builder::TableBuilder;

    fn build(options: &TableOptions, entries: &[(Vec<u8>, Vec<u8>)]) -> MemFile {
        let file = MemFile::new();
        let mut builder = TableBuilder::new(options.clone(), file.clone()).unwrap();
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish().unwrap();
        file
    }

    fn open(options: &TableOptions, file: &MemFile) -> TableReader {
        TableReader::open(options.clone(), Arc::new(file.clone()), file.len() as u64).unwrap()
    }

    fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n).map(|i| (format!("key{:05}", i).into_bytes(), format!("value{}", i).into_bytes())).collect()
    }

    fn scan(reader: &TableReader, read_options: &ReadOptions) -> Vec<Vec<u8>> {
        let mut iter = reader.iter(read_options).unwrap();
        let mut keys = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        iter.status().unwrap();
        keys
    }

    #[test]
    fn test_get_and_scan() {
        let options = TableOptions::default().compression(CompressionType::None).block_size(256);
        let data = entries(500);
        let file = build(&options, &data);
        let reader = open(&options, &file);

        let ro = ReadOptions::default();
        assert_eq!(reader.get(&ro, b"key00042").unwrap(), Some(b"value42".to_vec()));
        assert_eq!(reader.get(&ro, b"key00042x").unwrap(), None);
        assert_eq!(reader.get(&ro, b"zzz").unwrap(), None);
        assert_eq!(scan(&reader, &ro).len(), 500);
        assert_eq!(reader.table_properties().num_entries, 500);
    }

    #[test]
    fn test_get_with_visitor_stops() {
        let options = TableOptions::default().compression(CompressionType::None).block_size(128);
        let file = build(&options, &entries(100));
        let reader = open(&options, &file);

        let mut seen = Vec::new();
        reader
            .get_with(&ReadOptions::default(), b"key00010", |k, _| {
                seen.push(k.to_vec());
                seen.len() < 5
            })
            .unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], b"key00010");
        assert_eq!(seen[4], b"key00014");
    }

    #[test]
    fn test_approximate_offset_of() {
        let options = TableOptions::default().compression(CompressionType::None).block_size(256);
        let file = build(&options, &entries(1000));
        let reader = open(&options, &file);

        assert_eq!(reader.approximate_offset_of(b""), 0);
        let mid = reader.approximate_offset_of(b"key00500");
        let late = reader.approximate_offset_of(b"key00900");
        assert!(mid > 0 && mid < late);
        let end = reader.approximate_offset_of(b"zzz");
        assert_eq!(end, reader.footer().metaindex_handle.offset());
        assert!(late < end);
    }

    #[test]
    fn test_block_cache_hits_after_prefetch() {
        let cache: Arc<dyn Cache> = Arc::new(LruCache::new(1 << 20));
        let stats = Arc::new(Statistics::new());
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .block_size(256)
            .block_cache(cache.clone())
            .statistics(stats.clone());
        let file = build(&options, &entries(300));
        let reader = open(&options, &file);

        assert!(!reader.block_in_cache(b"key00100").unwrap());
        reader.prefetch(Some(b"key00100"), Some(b"key00150")).unwrap();
        assert!(reader.block_in_cache(b"key00100").unwrap());
        assert!(reader.block_in_cache(b"key00150").unwrap());
        assert!(!reader.block_in_cache(b"key00290").unwrap());

        let reads = stats.get(Ticker::BlockRead);
        assert_eq!(reader.get(&ReadOptions::default(), b"key00120").unwrap(), Some(b"value120".to_vec()));
        assert_eq!(stats.get(Ticker::BlockRead), reads);
        assert!(stats.get(Ticker::BlockCacheDataHit) > 0);

        assert!(reader.prefetch(Some(b"b"), Some(b"a")).is_err());
    }

    #[test]
    fn test_cached_index_and_filter() {
        let cache: Arc<dyn Cache> = Arc::new(LruCache::new(1 << 20));
        let stats = Arc::new(Statistics::new());
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
            .block_cache(cache.clone())
            .cache_index_and_filter_blocks(true)
            .statistics(stats.clone());
        let file = build(&options, &entries(200));
        let reader = open(&options, &file);

        assert_eq!(reader.approximate_memory_usage(), 0);
        assert_eq!(reader.get(&ReadOptions::default(), b"key00007").unwrap(), Some(b"value7".to_vec()));
        assert!(stats.get(Ticker::BlockCacheIndexHit) > 0);
        assert!(stats.get(Ticker::BlockCacheFilterHit) > 0);
        // Nothing stays pinned between calls.
        assert_eq!(cache.stats().insertions as usize, 3);
    }

    #[test]
    fn test_owned_index_memory_usage() {
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)));
        let file = build(&options, &entries(200));
        let reader = open(&options, &file);
        assert!(reader.approximate_memory_usage() > 0);
        assert_eq!(reader.filter_type(), Some(FilterType::Full));
    }

    #[test]
    fn test_lazy_index_without_prefetch() {
        let stats = Arc::new(Statistics::new());
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .prefetch_index_and_filter(false)
            .statistics(stats.clone());
        let file = build(&options, &entries(50));
        let reader = open(&options, &file);
        let after_open = stats.get(Ticker::BlockRead);
        assert_eq!(reader.approximate_memory_usage(), 0);

        reader.get(&ReadOptions::default(), b"key00001").unwrap();
        // Index plus one data block.
        assert_eq!(stats.get(Ticker::BlockRead), after_open + 2);
        assert!(reader.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_hash_index_lookups() {
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .block_size(64)
            .prefix_extractor(Arc::new(FixedPrefixTransform::new(3)))
            .index_type(IndexType::HashSearch);
        let mut data = Vec::new();
        for prefix in ["aaa", "bbb", "ddd"] {
            for i in 0..20 {
                data.push((format!("{}{:03}", prefix, i).into_bytes(), format!("v{}", i).into_bytes()));
            }
        }
        let file = build(&options, &data);
        let reader = open(&options, &file);
        assert_eq!(reader.index_type(), IndexType::HashSearch);

        let ro = ReadOptions::default();
        assert_eq!(reader.get(&ro, b"bbb007").unwrap(), Some(b"v7".to_vec()));
        assert_eq!(reader.get(&ro, b"ddd019").unwrap(), Some(b"v19".to_vec()));
        assert_eq!(reader.get(&ro, b"ccc000").unwrap(), None);
        assert_eq!(scan(&reader, &ro.total_order_seek(true)).len(), 60);
    }

    #[test]
    fn test_prefix_seek_skips_absent_prefix() {
        let stats = Arc::new(Statistics::new());
        let options = TableOptions::default()
            .compression(CompressionType::None)
            .prefix_extractor(Arc::new(FixedPrefixTransform::new(3)))
            .whole_key_filtering(false)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
            .statistics(stats.clone());
        let data: Vec<_> =
            (0..50).map(|i| (format!("aaa{:03}", i).into_bytes(), b"v".to_vec())).collect();
        let file = build(&options, &data);
        let reader = open(&options, &file);

        let mut iter = reader.iter(&ReadOptions::default()).unwrap();
        iter.seek(b"zzz000");
        assert!(!iter.valid());
        assert_eq!(stats.get(Ticker::BloomFilterPrefixUseful), 1);

        iter.seek(b"aaa010");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"aaa010");
    }

    #[test]
    fn test_mismatched_prefix_extractor_disables_prefix_filter() {
        let build_options = TableOptions::default()
            .compression(CompressionType::None)
            .prefix_extractor(Arc::new(FixedPrefixTransform::new(3)))
            .whole_key_filtering(false)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)));
        let data: Vec<_> = (0..20).map(|i| (format!("aaa{:03}", i).into_bytes(), b"v".to_vec())).collect();
        let file = build(&build_options, &data);

        let read_options = build_options.clone().prefix_extractor(Arc::new(FixedPrefixTransform::new(2)));
        let reader = open(&read_options, &file);
        assert_eq!(reader.get(&ReadOptions::default(), b"aaa005").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_range_tombstones_roundtrip() {
        let options = TableOptions::default().compression(CompressionType::None);
        let file = MemFile::new();
        let mut builder = TableBuilder::new(options.clone(), file.clone()).unwrap();
        builder.add(b"a", b"1").unwrap();
        builder.add_range_deletion(b"b", b"c").unwrap();
        builder.add_range_deletion(b"x", b"z").unwrap();
        builder.finish().unwrap();

        let reader = open(&options, &file);
        assert_eq!(
            reader.range_tombstones().unwrap(),
            vec![(b"b".to_vec(), b"c".to_vec()), (b"x".to_vec(), b"z".to_vec())]
        );
        assert_eq!(reader.table_properties().num_range_deletions, 2);
    }

    #[test]
    fn test_dump_table() {
        let options = TableOptions::default().compression(CompressionType::None);
        let file = build(&options, &entries(3));
        let reader = open(&options, &file);

        let mut out = Vec::new();
        reader.dump_table(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Footer Details:"));
        assert!(text.contains("rocksdb.properties"));
        assert!(text.contains("key00002 => value2"));
    }

    #[test]
    fn test_verify_checksums_detects_corruption() {
        let options = TableOptions::default().compression(CompressionType::None);
        let file = build(&options, &entries(100));
        let reader = open(&options, &file);
        reader.verify_checksums().unwrap();

        file.corrupt_byte(10, 0x01);
        let err = reader.verify_checksums().unwrap_err();
        assert!(err.is_corruption());
    }
}
