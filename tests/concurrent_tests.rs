// Concurrent Access Tests for blocktable
// These tests verify that one reader and one block cache can serve many threads

use blocktable::cache::{Cache, LruCache};
use blocktable::config::{IndexType, ReadOptions, TableOptions};
use blocktable::file::MemFile;
use blocktable::filter::BloomFilterPolicy;
use blocktable::sstable::{InternalIterator, TableBuilder, TableReader};
use std::sync::{Arc, Barrier};
use std::thread;

fn build(options: &TableOptions, count: usize, tag: &str) -> MemFile {
    let file = MemFile::new();
    let mut builder = TableBuilder::new(options.clone(), file.clone()).unwrap();
    for i in 0..count {
        let key = format!("key_{:08}", i);
        let value = format!("{}_value_{:08}", tag, i);
        builder.add(key.as_bytes(), value.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
    file
}

fn open(options: &TableOptions, file: &MemFile) -> TableReader {
    TableReader::open(options.clone(), Arc::new(file.clone()), file.len() as u64).unwrap()
}

/// Test concurrent point lookups through a cache too small to hold the table
#[test]
fn test_concurrent_gets_with_eviction() {
    let cache: Arc<dyn Cache> = Arc::new(LruCache::new(64 * 1024));
    let options = TableOptions::default()
        .block_size(1024)
        .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
        .block_cache(cache.clone())
        .cache_index_and_filter_blocks(true);
    let file = build(&options, 20_000, "t");
    let reader = Arc::new(open(&options, &file));

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));
    let mut handles = vec![];

    for thread_id in 0..num_threads {
        let reader = Arc::clone(&reader);
        let barrier = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            barrier.wait();
            let ro = ReadOptions::default();
            for i in (thread_id..20_000).step_by(num_threads * 3) {
                let key = format!("key_{:08}", i);
                let expected = format!("t_value_{:08}", i);
                assert_eq!(reader.get(&ro, key.as_bytes()).unwrap(), Some(expected.into_bytes()));
            }
            for i in 0..200 {
                let key = format!("missing_{}", i);
                assert_eq!(reader.get(&ro, key.as_bytes()).unwrap(), None);
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert!(stats.evictions > 0);
    assert!(stats.hits > 0);
    assert!(cache.usage() <= cache.capacity());
}

/// Test concurrent full scans over a partitioned index
#[test]
fn test_concurrent_iterators() {
    let options = TableOptions::default()
        .block_size(512)
        .index_type(IndexType::TwoLevelIndexSearch)
        .metadata_block_size(256)
        .block_cache(Arc::new(LruCache::new(1 << 20)));
    let file = build(&options, 5000, "s");
    let reader = open(&options, &file);

    let handles: Vec<_> = (0..4)
        .map(|thread_id| {
            let reader = reader.clone();
            thread::spawn(move || {
                let mut iter = reader.iter(&ReadOptions::default()).unwrap();
                let start = format!("key_{:08}", thread_id * 1000);
                iter.seek(start.as_bytes());
                let mut count = 0;
                while iter.valid() {
                    count += 1;
                    iter.next();
                }
                iter.status().unwrap();
                assert_eq!(count, 5000 - thread_id * 1000);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Test two tables sharing one block cache do not see each other's blocks
#[test]
fn test_shared_cache_isolation() {
    let cache: Arc<dyn Cache> = Arc::new(LruCache::new(4 << 20));
    let options = TableOptions::default().block_size(256).block_cache(cache.clone());
    let first = open(&options, &build(&options, 1000, "first"));
    let second = open(&options, &build(&options, 1000, "second"));

    let handles: Vec<_> = [(first, "first"), (second, "second")]
        .into_iter()
        .map(|(reader, tag)| {
            thread::spawn(move || {
                let ro = ReadOptions::default();
                for round in 0..3 {
                    for i in (round..1000).step_by(7) {
                        let key = format!("key_{:08}", i);
                        let expected = format!("{}_value_{:08}", tag, i);
                        assert_eq!(reader.get(&ro, key.as_bytes()).unwrap(), Some(expected.into_bytes()));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(cache.stats().hits > 0);
}

/// Test pinned index and filter blocks under concurrent readers
#[test]
fn test_concurrent_pinned_meta_blocks() {
    let cache: Arc<dyn Cache> = Arc::new(LruCache::new(1 << 20));
    let options = TableOptions::default()
        .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
        .block_cache(cache.clone())
        .cache_index_and_filter_blocks(true)
        .pin_index_and_filter_blocks(true)
        .prefetch_index_and_filter(false);
    let file = build(&options, 2000, "p");
    let reader = Arc::new(open(&options, &file));

    let handles: Vec<_> = (0..6)
        .map(|thread_id| {
            let reader = Arc::clone(&reader);
            thread::spawn(move || {
                let ro = ReadOptions::default();
                for i in (thread_id..2000).step_by(13) {
                    let key = format!("key_{:08}", i);
                    assert!(reader.get(&ro, key.as_bytes()).unwrap().is_some());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    // Pinned entries are charged to the cache, not to the reader.
    assert_eq!(reader.approximate_memory_usage(), 0);
}
