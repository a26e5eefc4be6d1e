//! Table properties: statistics about a table, written once into the
//! properties meta block at finish.
//!
//! Integer properties are stored as varint64, everything else as raw bytes.
//! Names not listed here are user-collected properties contributed by a
//! [`TablePropertiesCollector`].

use crate::coding::{decode_fixed32, get_varint64, put_fixed32, put_varint64};
use crate::comparator::BytewiseComparator;
use crate::config::IndexType;
use crate::error::Result;
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::iterator::InternalIterator;
use serde::Serializer;
use std::collections::{BTreeMap, VecDeque};

/// `rocksdb.data.size`
pub const DATA_SIZE: &str = "rocksdb.data.size";
/// `rocksdb.index.size`
pub const INDEX_SIZE: &str = "rocksdb.index.size";
/// `rocksdb.filter.size`
pub const FILTER_SIZE: &str = "rocksdb.filter.size";
/// `rocksdb.raw.key.size`
pub const RAW_KEY_SIZE: &str = "rocksdb.raw.key.size";
/// `rocksdb.raw.value.size`
pub const RAW_VALUE_SIZE: &str = "rocksdb.raw.value.size";
/// `rocksdb.num.data.blocks`
pub const NUM_DATA_BLOCKS: &str = "rocksdb.num.data.blocks";
/// `rocksdb.num.entries`
pub const NUM_ENTRIES: &str = "rocksdb.num.entries";
/// `rocksdb.num.range-deletions`
pub const NUM_RANGE_DELETIONS: &str = "rocksdb.num.range-deletions";
/// `rocksdb.format.version`
pub const FORMAT_VERSION: &str = "rocksdb.format.version";
/// `rocksdb.column.family.id`
pub const COLUMN_FAMILY_ID: &str = "rocksdb.column.family.id";
/// `rocksdb.column.family.name`
pub const COLUMN_FAMILY_NAME: &str = "rocksdb.column.family.name";
/// `rocksdb.filter.policy`
pub const FILTER_POLICY: &str = "rocksdb.filter.policy";
/// `rocksdb.comparator`
pub const COMPARATOR: &str = "rocksdb.comparator";
/// `rocksdb.merge.operator`
pub const MERGE_OPERATOR: &str = "rocksdb.merge.operator";
/// `rocksdb.prefix.extractor.name`
pub const PREFIX_EXTRACTOR_NAME: &str = "rocksdb.prefix.extractor.name";
/// `rocksdb.property.collectors`
pub const PROPERTY_COLLECTORS: &str = "rocksdb.property.collectors";
/// `rocksdb.compression`
pub const COMPRESSION: &str = "rocksdb.compression";

/// Index type, fixed32.
pub const INDEX_TYPE: &str = "rocksdb.block.based.table.index.type";
/// `"1"` when whole keys were added to the filter.
pub const WHOLE_KEY_FILTERING: &str = "rocksdb.block.based.table.whole.key.filtering";
/// `"1"` when key prefixes were added to the filter.
pub const PREFIX_FILTERING: &str = "rocksdb.block.based.table.prefix.filtering";

/// Column family id of tables not built for a column family.
pub const UNKNOWN_COLUMN_FAMILY: u32 = u32::MAX;

/// Name recorded for an unset merge operator or prefix extractor.
pub const NULLPTR: &str = "nullptr";

/// Statistics about a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableProperties {
    /// Total size of data blocks, trailers included.
    pub data_size: u64,
    /// Total size of index blocks, trailers included.
    pub index_size: u64,
    /// Total size of filter blocks, trailers included.
    pub filter_size: u64,
    /// Sum of key sizes.
    pub raw_key_size: u64,
    /// Sum of value sizes.
    pub raw_value_size: u64,
    /// Number of data blocks.
    pub num_data_blocks: u64,
    /// Number of entries, range deletions included.
    pub num_entries: u64,
    /// Number of range deletions.
    pub num_range_deletions: u64,
    /// Table format version.
    pub format_version: u64,
    /// Column family id, [`UNKNOWN_COLUMN_FAMILY`] if none.
    pub column_family_id: u64,
    /// Column family name.
    pub column_family_name: String,
    /// Filter policy name, empty without a filter.
    pub filter_policy_name: String,
    /// Comparator name.
    pub comparator_name: String,
    /// Merge operator name or `nullptr`.
    pub merge_operator_name: String,
    /// Prefix extractor name or `nullptr`.
    pub prefix_extractor_name: String,
    /// Collector factory names, as `[a,b]`.
    pub property_collectors_names: String,
    /// Compression type name.
    pub compression_name: String,
    /// Properties contributed by collectors, including the built-in
    /// block-based ones.
    #[serde(serialize_with = "serialize_lossy")]
    pub user_collected_properties: BTreeMap<String, Vec<u8>>,
    /// Human-readable collector output. Only set on the building side.
    pub readable_properties: BTreeMap<String, String>,
}

fn serialize_lossy<S: Serializer>(map: &BTreeMap<String, Vec<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(map.iter().map(|(k, v)| (k, String::from_utf8_lossy(v))))
}

impl TableProperties {
    /// Pretty JSON of every property.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::Error::invalid_argument(e.to_string()))
    }

    /// Index type recorded by the block-based collector.
    pub fn index_type(&self) -> Option<IndexType> {
        let raw = self.user_collected_properties.get(INDEX_TYPE)?;
        IndexType::from_u32(decode_fixed32(raw)?)
    }

    /// Whether whole keys were added to the filter. Defaults to true when
    /// the property is missing.
    pub fn whole_key_filtering(&self) -> bool {
        self.user_collected_properties.get(WHOLE_KEY_FILTERING).map_or(true, |v| v.as_slice() == b"1")
    }

    /// Whether key prefixes were added to the filter.
    pub fn prefix_filtering(&self) -> bool {
        self.user_collected_properties.get(PREFIX_FILTERING).is_some_and(|v| v.as_slice() == b"1")
    }

    /// Serializes the properties block.
    pub fn encode(&self) -> Vec<u8> {
        let mut props: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        let mut add_u64 = |name, value| {
            let mut buf = Vec::new();
            put_varint64(&mut buf, value);
            props.insert(name, buf);
        };
        add_u64(DATA_SIZE, self.data_size);
        add_u64(INDEX_SIZE, self.index_size);
        add_u64(FILTER_SIZE, self.filter_size);
        add_u64(RAW_KEY_SIZE, self.raw_key_size);
        add_u64(RAW_VALUE_SIZE, self.raw_value_size);
        add_u64(NUM_DATA_BLOCKS, self.num_data_blocks);
        add_u64(NUM_ENTRIES, self.num_entries);
        add_u64(NUM_RANGE_DELETIONS, self.num_range_deletions);
        add_u64(FORMAT_VERSION, self.format_version);
        add_u64(COLUMN_FAMILY_ID, self.column_family_id);

        let strings = [
            (COLUMN_FAMILY_NAME, &self.column_family_name),
            (FILTER_POLICY, &self.filter_policy_name),
            (COMPARATOR, &self.comparator_name),
            (MERGE_OPERATOR, &self.merge_operator_name),
            (PREFIX_EXTRACTOR_NAME, &self.prefix_extractor_name),
            (PROPERTY_COLLECTORS, &self.property_collectors_names),
            (COMPRESSION, &self.compression_name),
        ];
        for (name, value) in strings {
            if !value.is_empty() {
                props.insert(name, value.as_bytes().to_vec());
            }
        }
        for (name, value) in &self.user_collected_properties {
            props.entry(name.as_str()).or_insert_with(|| value.clone());
        }

        let mut builder = BlockBuilder::new(1, true);
        for (name, value) in &props {
            builder.add(name.as_bytes(), value);
        }
        builder.finish()
    }

    /// Parses a properties block. Malformed integer values are logged and
    /// skipped.
    pub fn decode(block: &Block) -> Result<Self> {
        let mut props = TableProperties::default();
        let mut iter = block.iter(BytewiseComparator::shared());
        iter.seek_to_first();
        while iter.valid() {
            let name = String::from_utf8_lossy(iter.key()).into_owned();
            let value = iter.value();
            let int_field = match name.as_str() {
                DATA_SIZE => Some(&mut props.data_size),
                INDEX_SIZE => Some(&mut props.index_size),
                FILTER_SIZE => Some(&mut props.filter_size),
                RAW_KEY_SIZE => Some(&mut props.raw_key_size),
                RAW_VALUE_SIZE => Some(&mut props.raw_value_size),
                NUM_DATA_BLOCKS => Some(&mut props.num_data_blocks),
                NUM_ENTRIES => Some(&mut props.num_entries),
                NUM_RANGE_DELETIONS => Some(&mut props.num_range_deletions),
                FORMAT_VERSION => Some(&mut props.format_version),
                COLUMN_FAMILY_ID => Some(&mut props.column_family_id),
                _ => None,
            };
            if let Some(field) = int_field {
                let mut input = value;
                match get_varint64(&mut input) {
                    Some(v) => *field = v,
                    None => log::warn!("Detect malformed value in properties meta-block: {}", name),
                }
            } else {
                let text = String::from_utf8_lossy(value).into_owned();
                match name.as_str() {
                    COLUMN_FAMILY_NAME => props.column_family_name = text,
                    FILTER_POLICY => props.filter_policy_name = text,
                    COMPARATOR => props.comparator_name = text,
                    MERGE_OPERATOR => props.merge_operator_name = text,
                    PREFIX_EXTRACTOR_NAME => props.prefix_extractor_name = text,
                    PROPERTY_COLLECTORS => props.property_collectors_names = text,
                    COMPRESSION => props.compression_name = text,
                    _ => {
                        props.user_collected_properties.insert(name, value.to_vec());
                    }
                }
            }
            iter.next();
        }
        iter.status()?;
        Ok(props)
    }
}

/// Observes every entry added to a table and contributes properties at
/// finish.
pub trait TablePropertiesCollector: Send {
    /// Collector name.
    fn name(&self) -> &str;

    /// Called for every key/value added to the table.
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Adds the collected properties to `properties`.
    fn finish(&mut self, properties: &mut BTreeMap<String, Vec<u8>>) -> Result<()>;

    /// Human-readable form of the collected properties.
    fn readable_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Whether the finished table should be compacted soon.
    fn need_compact(&self) -> bool {
        false
    }
}

/// Creates a collector per table.
pub trait TablePropertiesCollectorFactory: Send + Sync {
    /// Factory name, recorded in `rocksdb.property.collectors`.
    fn name(&self) -> &str;

    /// A fresh collector for a table of column family `column_family_id`.
    fn create(&self, column_family_id: u32) -> Box<dyn TablePropertiesCollector>;
}

/// Records the index type and filter modes the table was built with.
#[derive(Debug, Clone)]
pub struct BlockBasedTablePropertiesCollector {
    index_type: IndexType,
    whole_key_filtering: bool,
    prefix_filtering: bool,
}

impl BlockBasedTablePropertiesCollector {
    /// Create a collector for a table with the given layout.
    pub fn new(index_type: IndexType, whole_key_filtering: bool, prefix_filtering: bool) -> Self {
        Self { index_type, whole_key_filtering, prefix_filtering }
    }
}

fn flag(value: bool) -> Vec<u8> {
    if value { b"1".to_vec() } else { b"0".to_vec() }
}

impl TablePropertiesCollector for BlockBasedTablePropertiesCollector {
    fn name(&self) -> &str {
        "BlockBasedTablePropertiesCollector"
    }

    fn add(&mut self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, properties: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        let mut index_type = Vec::with_capacity(4);
        put_fixed32(&mut index_type, self.index_type as u32);
        properties.insert(INDEX_TYPE.to_string(), index_type);
        properties.insert(WHOLE_KEY_FILTERING.to_string(), flag(self.whole_key_filtering));
        properties.insert(PREFIX_FILTERING.to_string(), flag(self.prefix_filtering));
        Ok(())
    }
}

/// Requests compaction when any window of `window_size` consecutive entries
/// holds at least `deletion_trigger` deletions. An empty value counts as a
/// deletion.
#[derive(Debug, Clone)]
pub struct CompactOnDeletionCollector {
    window_size: usize,
    deletion_trigger: usize,
    window: VecDeque<bool>,
    deletions_in_window: usize,
    need_compaction: bool,
}

impl CompactOnDeletionCollector {
    /// Create a collector.
    pub fn new(window_size: usize, deletion_trigger: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            deletion_trigger: deletion_trigger.max(1),
            window: VecDeque::new(),
            deletions_in_window: 0,
            need_compaction: false,
        }
    }
}

impl TablePropertiesCollector for CompactOnDeletionCollector {
    fn name(&self) -> &str {
        "CompactOnDeletionCollector"
    }

    fn add(&mut self, _key: &[u8], value: &[u8]) -> Result<()> {
        if self.need_compaction {
            // If the output file already needs to be compacted, skip the check.
            return Ok(());
        }
        let is_deletion = value.is_empty();
        self.window.push_back(is_deletion);
        if is_deletion {
            self.deletions_in_window += 1;
        }
        if self.window.len() > self.window_size && self.window.pop_front() == Some(true) {
            self.deletions_in_window -= 1;
        }
        if self.deletions_in_window >= self.deletion_trigger {
            self.need_compaction = true;
        }
        Ok(())
    }

    fn finish(&mut self, _properties: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        Ok(())
    }

    fn readable_properties(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("need.compaction".to_string(), self.need_compaction.to_string());
        out
    }

    fn need_compact(&self) -> bool {
        self.need_compaction
    }
}

/// Factory for [`CompactOnDeletionCollector`].
#[derive(Debug, Clone, Copy)]
pub struct CompactOnDeletionCollectorFactory {
    window_size: usize,
    deletion_trigger: usize,
}

impl CompactOnDeletionCollectorFactory {
    /// Create a factory.
    pub fn new(window_size: usize, deletion_trigger: usize) -> Self {
        Self { window_size, deletion_trigger }
    }
}

impl TablePropertiesCollectorFactory for CompactOnDeletionCollectorFactory {
    fn name(&self) -> &str {
        "CompactOnDeletionCollector"
    }

    fn create(&self, _column_family_id: u32) -> Box<dyn TablePropertiesCollector> {
        Box::new(CompactOnDeletionCollector::new(self.window_size, self.deletion_trigger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> TableProperties {
        let mut props = TableProperties {
            data_size: 4096,
            index_size: 120,
            filter_size: 64,
            raw_key_size: 260,
            raw_value_size: 1024,
            num_data_blocks: 3,
            num_entries: 26,
            num_range_deletions: 1,
            format_version: 2,
            column_family_id: UNKNOWN_COLUMN_FAMILY as u64,
            column_family_name: "default".into(),
            filter_policy_name: "rocksdb.BuiltinBloomFilter".into(),
            comparator_name: "leveldb.BytewiseComparator".into(),
            merge_operator_name: NULLPTR.into(),
            prefix_extractor_name: NULLPTR.into(),
            property_collectors_names: "[]".into(),
            compression_name: "Snappy".into(),
            ..Default::default()
        };
        let mut collector = BlockBasedTablePropertiesCollector::new(IndexType::TwoLevelIndexSearch, true, false);
        collector.finish(&mut props.user_collected_properties).unwrap();
        props.user_collected_properties.insert("my.prop".into(), b"value".to_vec());
        props
    }

    #[test]
    fn test_properties_roundtrip() {
        let props = sample();
        let block = Block::new(Bytes::from(props.encode())).unwrap();
        let decoded = TableProperties::decode(&block).unwrap();
        assert_eq!(decoded, props);
        assert_eq!(decoded.index_type(), Some(IndexType::TwoLevelIndexSearch));
        assert!(decoded.whole_key_filtering());
        assert!(!decoded.prefix_filtering());
    }

    #[test]
    fn test_malformed_integer_is_skipped() {
        let mut builder = BlockBuilder::new(1, true);
        builder.add(NUM_DATA_BLOCKS.as_bytes(), &[0x80]);
        builder.add(NUM_ENTRIES.as_bytes(), &[7]);
        let block = Block::new(Bytes::from(builder.finish())).unwrap();
        let props = TableProperties::decode(&block).unwrap();
        assert_eq!(props.num_data_blocks, 0);
        assert_eq!(props.num_entries, 7);
    }

    #[test]
    fn test_to_json() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["num_entries"], 26);
        assert_eq!(value["compression_name"], "Snappy");
        assert_eq!(value["user_collected_properties"]["my.prop"], "value");
    }

    #[test]
    fn test_compact_on_deletion_window() {
        let mut collector = CompactOnDeletionCollector::new(4, 3);
        for value in [&b"v"[..], b"", b"v", b"", b"v", b"v"] {
            collector.add(b"k", value).unwrap();
        }
        // Never three deletions within four entries.
        assert!(!collector.need_compact());

        collector.add(b"k", b"").unwrap();
        collector.add(b"k", b"").unwrap();
        collector.add(b"k", b"").unwrap();
        assert!(collector.need_compact());
        assert_eq!(collector.readable_properties()["need.compaction"], "true");
    }

    #[test]
    fn test_factory() {
        let factory = CompactOnDeletionCollectorFactory::new(2, 1);
        let mut collector = factory.create(UNKNOWN_COLUMN_FAMILY);
        collector.add(b"k", b"").unwrap();
        assert!(collector.need_compact());
        assert_eq!(factory.name(), "CompactOnDeletionCollector");
    }
}
