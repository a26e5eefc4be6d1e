// Fault Injection Tests for blocktable
// These tests damage table files and check how the reader reports it

use blocktable::config::{ChecksumType, CompressionType, ReadOptions, TableOptions};
use blocktable::file::MemFile;
use blocktable::filter::{BloomFilterPolicy, FilterType};
use blocktable::sstable::format::{read_block_contents, BlockFetchContext, BlockHandle};
use blocktable::sstable::meta_index::{MetaIndex, PROPERTIES_BLOCK};
use blocktable::sstable::{Block, InternalIterator, TableBuilder, TableReader};
use blocktable::Error;
use std::sync::Arc;

fn options() -> TableOptions {
    TableOptions::default()
        .compression(CompressionType::None)
        .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
}

fn build(options: &TableOptions, count: usize) -> MemFile {
    let file = MemFile::new();
    let mut builder = TableBuilder::new(options.clone(), file.clone()).unwrap();
    for i in 0..count {
        let key = format!("key_{:08}", i);
        let value = format!("value_{:08}", i);
        builder.add(key.as_bytes(), value.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
    file
}

fn open(options: &TableOptions, file: &MemFile) -> blocktable::Result<TableReader> {
    TableReader::open(options.clone(), Arc::new(file.clone()), file.len() as u64)
}

fn meta_handle(file: &MemFile, reader: &TableReader, name: &str) -> BlockHandle {
    let ctx = BlockFetchContext {
        file,
        checksum: ChecksumType::Crc32c,
        verify_checksums: true,
        persistent_cache: None,
        cache_key_prefix: &[],
        compression_dict: &[],
        statistics: None,
    };
    let contents = read_block_contents(&ctx, &reader.footer().metaindex_handle, true).unwrap();
    let meta_index = MetaIndex::from_block(&Block::new(contents.data).unwrap()).unwrap();
    meta_index.find(name).unwrap()
}

/// Test a flipped byte in a data block with and without checksum verification
#[test]
fn test_data_block_corruption() {
    let options = options();
    let file = build(&options, 100);
    let reader = open(&options, &file).unwrap();

    // Entry header (3 bytes) and the 12 byte key come before the value.
    file.corrupt_byte(3 + 12 + 5, 0x01);

    let err = reader.get(&ReadOptions::default(), b"key_00000000").unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, Error::ChecksumMismatch { .. }));

    let unchecked = ReadOptions::default().verify_checksums(false);
    assert_eq!(reader.get(&unchecked, b"key_00000000").unwrap(), Some(b"value^00000000".to_vec()));

    assert!(reader.verify_checksums().unwrap_err().is_corruption());
}

/// Test iterator status after reading a corrupt block
#[test]
fn test_iterator_reports_corruption() {
    let options = options().block_size(128);
    let file = build(&options, 200);
    let reader = open(&options, &file).unwrap();
    file.corrupt_byte(0, 0x80);

    let mut iter = reader.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    assert!(!iter.valid());
    assert!(iter.status().unwrap_err().is_corruption());
}

/// Test a damaged index block is detected at open
#[test]
fn test_index_block_corruption() {
    let options = options();
    let file = build(&options, 100);
    let index_offset = open(&options, &file).unwrap().footer().index_handle.offset();
    file.corrupt_byte(index_offset as usize, 0x40);

    assert!(open(&options, &file).unwrap_err().is_corruption());

    // A lazily loaded index fails on first use instead.
    let lazy = options.prefetch_index_and_filter(false);
    let reader = open(&lazy, &file).unwrap();
    assert!(reader.get(&ReadOptions::default(), b"key_00000001").unwrap_err().is_corruption());
}

/// Test a damaged properties block falls back to default properties
#[test]
fn test_properties_block_corruption() {
    let options = options();
    let file = build(&options, 100);
    let handle = meta_handle(&file, &open(&options, &file).unwrap(), PROPERTIES_BLOCK);
    file.corrupt_byte(handle.offset() as usize + 2, 0xff);

    let reader = open(&options, &file).unwrap();
    assert_eq!(reader.table_properties().num_entries, 0);
    assert_eq!(reader.get(&ReadOptions::default(), b"key_00000042").unwrap(), Some(b"value_00000042".to_vec()));
}

/// Test a damaged filter block disables filtering without failing reads
#[test]
fn test_filter_block_corruption() {
    let options = options();
    let file = build(&options, 100);
    let name = FilterType::Full.meta_key(&BloomFilterPolicy::new(10));
    let handle = meta_handle(&file, &open(&options, &file).unwrap(), &name);
    file.corrupt_byte(handle.offset() as usize, 0x10);

    let reader = open(&options, &file).unwrap();
    assert_eq!(reader.get(&ReadOptions::default(), b"key_00000042").unwrap(), Some(b"value_00000042".to_vec()));
    assert_eq!(reader.get(&ReadOptions::default(), b"nope").unwrap(), None);
}

/// Test damaged or truncated footers
#[test]
fn test_footer_damage() {
    let options = options();
    let file = build(&options, 10);
    let len = file.len();

    let bad_magic = MemFile::from_vec(file.contents());
    bad_magic.corrupt_byte(len - 1, 0xff);
    assert!(open(&options, &bad_magic).unwrap_err().is_corruption());

    let truncated = MemFile::from_vec(file.contents());
    truncated.truncate(len - 10);
    assert!(open(&options, &truncated).is_err());

    let tiny = MemFile::from_vec(vec![0u8; 20]);
    assert!(open(&options, &tiny).unwrap_err().is_corruption());

    let zeros = MemFile::from_vec(vec![0u8; 4096]);
    assert!(open(&options, &zeros).unwrap_err().is_corruption());
}

/// Test a file size larger than the real file
#[test]
fn test_wrong_file_size() {
    let options = options();
    let file = build(&options, 10);
    let result = TableReader::open(options, Arc::new(file.clone()), file.len() as u64 + 100);
    assert!(result.is_err());
}
