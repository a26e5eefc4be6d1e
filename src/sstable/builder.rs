//! Table builder.
//!
//! Builds a table file from a sequence of sorted key-value pairs. The file is
//! laid out as data blocks, filter blocks, meta blocks, the meta-index block,
//! index block(s) and the footer.

use crate::cache::{CacheValue, Priority};
use crate::coding::put_varint64;
use crate::compression::{compress_block, CompressionContext};
use crate::config::{ChecksumType, CompressionType, TableOptions};
use crate::error::{Error, Result};
use crate::file::{FileWriter, WritableFile};
use crate::filter::FilterBlockBuilder;
use crate::sstable::block::BlockBuilder;
use crate::sstable::flush_policy::FlushBlockPolicy;
use crate::sstable::format::{
    block_trailer, cache_key, BlockContents, BlockHandle, Footer, BLOCK_BASED_TABLE_MAGIC_NUMBER,
    BLOCK_TRAILER_SIZE, EXTENT_BASED_TABLE_MAGIC_NUMBER,
};
use crate::sstable::index::{FinishStep, IndexBuilder};
use crate::sstable::meta_index::{MetaIndexBuilder, COMPRESSION_DICT_BLOCK, PROPERTIES_BLOCK, RANGE_DEL_BLOCK};
use crate::sstable::properties::{
    BlockBasedTablePropertiesCollector, TableProperties, TablePropertiesCollector, NULLPTR, UNKNOWN_COLUMN_FAMILY,
};
use bytes::Bytes;
use std::cmp::Ordering;
use std::path::Path;

/// TableBuilder builds a table file.
///
/// A builder is open until exactly one of [`finish`](Self::finish) or
/// [`abandon`](Self::abandon) is called. The first error is latched and
/// returned from every later mutating call.
///
/// Usage:
/// ```no_run
/// use blocktable::config::TableOptions;
/// use blocktable::sstable::TableBuilder;
///
/// let mut builder = TableBuilder::create("table.sst", TableOptions::default()).unwrap();
/// builder.add(b"key1", b"value1").unwrap();
/// builder.add(b"key2", b"value2").unwrap();
/// builder.finish().unwrap();
/// ```
pub struct TableBuilder {
    options: TableOptions,
    file: Box<dyn WritableFile>,
    offset: u64,
    status: Result<()>,
    closed: bool,
    data_block: BlockBuilder,
    range_del_block: BlockBuilder,
    index_builder: IndexBuilder,
    filter_builder: Option<FilterBlockBuilder>,
    flush_policy: Box<dyn FlushBlockPolicy>,
    collectors: Vec<Box<dyn TablePropertiesCollector>>,
    props: TableProperties,
    last_key: Vec<u8>,
    last_range_del_begin: Option<Vec<u8>>,
    pending_handle: Option<BlockHandle>,
    compressed_cache_key_prefix: Vec<u8>,
}

impl TableBuilder {
    /// Create a builder writing a new file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, options: TableOptions) -> Result<Self> {
        Self::new(options, FileWriter::create(path)?)
    }

    /// Create a builder appending to `file`, which must be empty.
    pub fn new<W: WritableFile + 'static>(mut options: TableOptions, file: W) -> Result<Self> {
        options.validate()?;
        if options.format_version == 0 && options.checksum != ChecksumType::Crc32c {
            log::info!(
                "Silently converting format_version to 1 because checksum is non-default ({:?})",
                options.checksum
            );
            options.format_version = 1;
        }

        let index_builder = IndexBuilder::from_options(&options)?;
        let filter_builder = FilterBlockBuilder::from_options(&options, index_builder.partition_cut_link());
        let flush_policy = options.flush_block_policy_factory.new_policy(&options);

        let column_family_id = options.column_family_id.unwrap_or(UNKNOWN_COLUMN_FAMILY);
        let mut collectors: Vec<Box<dyn TablePropertiesCollector>> = options
            .table_properties_collector_factories
            .iter()
            .map(|factory| factory.create(column_family_id))
            .collect();
        collectors.push(Box::new(BlockBasedTablePropertiesCollector::new(
            options.index_type,
            options.whole_key_filtering,
            options.prefix_extractor.is_some(),
        )));

        let compressed_cache_key_prefix = match &options.block_cache_compressed {
            Some(cache) => file.unique_id().unwrap_or_else(|| {
                let mut prefix = Vec::new();
                put_varint64(&mut prefix, cache.new_id());
                prefix
            }),
            None => Vec::new(),
        };

        let props = TableProperties {
            format_version: u64::from(options.format_version),
            column_family_id: u64::from(column_family_id),
            column_family_name: options.column_family_name.clone().unwrap_or_default(),
            filter_policy_name: options.filter_policy.as_ref().map(|p| p.name().to_string()).unwrap_or_default(),
            comparator_name: options.comparator.name().to_string(),
            merge_operator_name: options.merge_operator_name.clone().unwrap_or_else(|| NULLPTR.to_string()),
            prefix_extractor_name: options
                .prefix_extractor
                .as_ref()
                .map(|p| p.name().to_string())
                .unwrap_or_else(|| NULLPTR.to_string()),
            property_collectors_names: format!(
                "[{}]",
                options
                    .table_properties_collector_factories
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            compression_name: options.compression.name().to_string(),
            ..TableProperties::default()
        };

        Ok(Self {
            data_block: BlockBuilder::new(options.block_restart_interval, options.use_delta_encoding),
            range_del_block: BlockBuilder::new(1, true),
            index_builder,
            filter_builder,
            flush_policy,
            collectors,
            props,
            options,
            file: Box::new(file),
            offset: 0,
            status: Ok(()),
            closed: false,
            last_key: Vec::new(),
            last_range_del_begin: None,
            pending_handle: None,
            compressed_cache_key_prefix,
        })
    }

    /// Add a key-value pair to the table.
    ///
    /// # Panics
    ///
    /// Panics if the builder is closed or if `key` is not greater than the
    /// previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed, "add called on a closed table builder");
        self.status.clone()?;
        if self.props.num_entries > self.props.num_range_deletions {
            assert_eq!(
                self.options.comparator.compare(key, &self.last_key),
                Ordering::Greater,
                "keys must be added in increasing order"
            );
        }

        let result = self.add_inner(key, value);
        self.latch(result)
    }

    fn add_inner(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.flush_policy.update(&self.data_block, key, value) {
            self.flush_data_block()?;
        }

        // The index entry of a flushed block waits for the first key of the
        // next block so the separator can be shortened.
        if let Some(handle) = self.pending_handle.take() {
            self.index_builder.add_index_entry(&self.last_key, Some(key), &handle);
        }

        if let Some(filter) = &mut self.filter_builder {
            filter.add(key);
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.props.num_entries += 1;
        self.props.raw_key_size += key.len() as u64;
        self.props.raw_value_size += value.len() as u64;

        self.index_builder.on_key_added(key);
        self.notify_collectors(key, value);
        Ok(())
    }

    /// Adds a range deletion `[begin, end)`. Begin keys must be strictly
    /// increasing across calls.
    ///
    /// # Panics
    ///
    /// Panics if the builder is closed or `begin` is out of order.
    pub fn add_range_deletion(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        assert!(!self.closed, "add_range_deletion called on a closed table builder");
        self.status.clone()?;
        if let Some(last) = &self.last_range_del_begin {
            assert_eq!(
                self.options.comparator.compare(begin, last),
                Ordering::Greater,
                "range deletions must be added in increasing order"
            );
        }

        self.range_del_block.add(begin, end);
        self.last_range_del_begin = Some(begin.to_vec());
        self.props.num_entries += 1;
        self.props.num_range_deletions += 1;
        self.props.raw_key_size += begin.len() as u64;
        self.props.raw_value_size += end.len() as u64;
        self.notify_collectors(begin, end);
        Ok(())
    }

    fn notify_collectors(&mut self, key: &[u8], value: &[u8]) {
        for collector in &mut self.collectors {
            if let Err(e) = collector.add(key, value) {
                log::warn!("Error adding to table properties collector {}: {}", collector.name(), e);
            }
        }
    }

    /// Writes the current data block, if any.
    ///
    /// Normally blocks are cut by the flush policy; this forces a cut.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed, "flush called on a closed table builder");
        self.status.clone()?;
        let result = self.flush_data_block();
        self.latch(result)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let raw = self.data_block.finish();
        let handle = self.write_block(&raw)?;
        self.props.data_size = self.offset;
        self.props.num_data_blocks += 1;
        if let Some(filter) = &mut self.filter_builder {
            filter.start_block(self.offset);
        }
        self.pending_handle = Some(handle);
        Ok(())
    }

    /// Compresses `raw` per the options and writes it.
    fn write_block(&mut self, raw: &[u8]) -> Result<BlockHandle> {
        let (contents, compression_type) = {
            let ctx = CompressionContext {
                compression: self.options.compression,
                level: self.options.compression_level,
                dict: &self.options.compression_dict,
                size_limit: self.options.compression_size_limit,
                verify: self.options.verify_compression,
            };
            compress_block(raw, &ctx)?
        };
        self.write_raw_block(&contents, compression_type)
    }

    /// Appends `contents` and its trailer at the current offset.
    fn write_raw_block(&mut self, contents: &[u8], compression_type: CompressionType) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let trailer = block_trailer(self.options.checksum, contents, compression_type)?;
        self.file.append(contents)?;
        self.file.append(&trailer)?;

        if compression_type != CompressionType::None {
            self.insert_block_in_compressed_cache(contents, compression_type, &handle);
        }
        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }

    fn insert_block_in_compressed_cache(&self, contents: &[u8], compression_type: CompressionType, handle: &BlockHandle) {
        let Some(cache) = &self.options.block_cache_compressed else {
            return;
        };
        let key = cache_key(&self.compressed_cache_key_prefix, handle.offset());
        let value = CacheValue::Compressed(BlockContents::new(Bytes::copy_from_slice(contents), compression_type));
        match cache.insert(&key, value, contents.len(), Priority::Low) {
            Ok(cache_handle) => cache.release(cache_handle),
            Err(e) => log::warn!("Failed to insert block at {} into the compressed block cache: {}", handle, e),
        }
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.status.is_ok() {
                log::error!("Table builder failed: {}", e);
                self.status = Err(e.clone());
            }
        }
        result
    }

    /// Finish building the table and return the file size.
    ///
    /// # Panics
    ///
    /// Panics if the builder is closed.
    pub fn finish(&mut self) -> Result<u64> {
        assert!(!self.closed, "finish called on a closed table builder");
        if let Err(e) = self.status.clone() {
            self.closed = true;
            return Err(e);
        }
        let result = self.finish_inner();
        self.closed = true;
        self.latch(result)
    }

    fn finish_inner(&mut self) -> Result<u64> {
        self.flush_data_block()?;
        if let Some(handle) = self.pending_handle.take() {
            self.index_builder.add_index_entry(&self.last_key, None, &handle);
        }

        let mut index_step = self.index_builder.finish(None)?;
        let mut meta_index = MetaIndexBuilder::new();

        // Write meta blocks and metaindex block with the following order.
        //    1. [meta block: filter]
        //    2. [meta block: hash index prefixes]
        //    3. [meta block: properties]
        //    4. [meta block: compression dictionary]
        //    5. [meta block: range deletion tombstone]
        //    6. [metaindex block]
        if let Some(mut filter) = self.filter_builder.take() {
            let mut last_handle = None;
            let handle = loop {
                match filter.finish(last_handle)? {
                    FinishStep::Partial(contents) => {
                        last_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
                        self.props.filter_size += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
                    }
                    FinishStep::Complete(contents) => {
                        self.props.filter_size += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
                        break self.write_raw_block(&contents, CompressionType::None)?;
                    }
                }
            };
            if let Some(policy) = &self.options.filter_policy {
                meta_index.add(filter.filter_type().meta_key(policy.as_ref()), handle);
            }
        }

        for (name, contents) in self.index_builder.take_meta_blocks() {
            let handle = self.write_raw_block(&contents, CompressionType::None)?;
            meta_index.add(name, handle);
        }

        self.props.index_size = match &index_step {
            FinishStep::Complete(contents) => (contents.len() + BLOCK_TRAILER_SIZE) as u64,
            FinishStep::Partial(_) => self.index_builder.estimated_size() as u64,
        };
        for collector in &mut self.collectors {
            if let Err(e) = collector.finish(&mut self.props.user_collected_properties) {
                log::error!("Error finishing table properties collector {}: {}", collector.name(), e);
            }
            self.props.readable_properties.extend(collector.readable_properties());
        }
        let properties = self.props.encode();
        let handle = self.write_raw_block(&properties, CompressionType::None)?;
        meta_index.add(PROPERTIES_BLOCK, handle);

        if !self.options.compression_dict.is_empty() {
            let dict = std::mem::take(&mut self.options.compression_dict);
            let handle = self.write_raw_block(&dict, CompressionType::None)?;
            meta_index.add(COMPRESSION_DICT_BLOCK, handle);
            self.options.compression_dict = dict;
        }

        if !self.range_del_block.is_empty() {
            let contents = self.range_del_block.finish();
            let handle = self.write_raw_block(&contents, CompressionType::None)?;
            meta_index.add(RANGE_DEL_BLOCK, handle);
        }

        let metaindex_handle = self.write_raw_block(&meta_index.finish(), CompressionType::None)?;

        let index_handle = loop {
            match index_step {
                FinishStep::Partial(contents) => {
                    let handle = self.write_block(&contents)?;
                    index_step = self.index_builder.finish(Some(handle))?;
                }
                FinishStep::Complete(contents) => break self.write_block(&contents)?,
            }
        };

        self.write_footer(metaindex_handle, index_handle)?;
        self.file.flush()?;
        Ok(self.offset)
    }

    fn write_footer(&mut self, metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Result<()> {
        let magic = if self.options.extent.is_some() {
            EXTENT_BASED_TABLE_MAGIC_NUMBER
        } else {
            BLOCK_BASED_TABLE_MAGIC_NUMBER
        };
        let mut footer = Footer::new(magic, self.options.format_version);
        footer.checksum = self.options.checksum;
        footer.metaindex_handle = metaindex_handle;
        footer.index_handle = index_handle;

        if let Some(extent) = self.options.extent {
            let footer_end = self.offset + Footer::EXTENT_ENCODED_LENGTH as u64;
            if footer_end > extent.extent_size {
                return Err(Error::invalid_argument(format!(
                    "table of {} bytes does not fit in an extent of {} bytes",
                    footer_end, extent.extent_size
                )));
            }
            footer.valid_size = u32::try_from(self.offset)
                .map_err(|_| Error::invalid_argument("extent table data exceeds 4GB"))?;
            footer.next_extent = extent.next_extent;

            let padding = vec![0u8; (extent.extent_size - footer_end) as usize];
            self.file.append(&padding)?;
            self.offset += padding.len() as u64;
        }

        let encoded = footer.encode();
        self.file.append(&encoded)?;
        self.offset += encoded.len() as u64;
        Ok(())
    }

    /// Stop building. The partially written file is not a valid table.
    ///
    /// # Panics
    ///
    /// Panics if the builder is closed.
    pub fn abandon(&mut self) {
        assert!(!self.closed, "abandon called on a closed table builder");
        self.closed = true;
    }

    /// Number of entries added so far, range deletions included.
    pub fn num_entries(&self) -> u64 {
        self.props.num_entries
    }

    /// Bytes written so far.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// The latched status.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Whether any properties collector asks for this table to be compacted.
    pub fn need_compact(&self) -> bool {
        self.collectors.iter().any(|c| c.need_compact())
    }

    /// Properties gathered so far. Complete once the table is finished.
    pub fn table_properties(&self) -> TableProperties {
        let mut props = self.props.clone();
        for collector in &self.collectors {
            props.readable_properties.extend(collector.readable_properties());
        }
        props
    }

    /// Whether `finish` or `abandon` was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TableBuilder {
    fn drop(&mut self) {
        if !self.closed {
            log::debug!("Table builder dropped without finish or abandon");
        }
    }
}
