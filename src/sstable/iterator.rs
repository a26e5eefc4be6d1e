//! Iterators over table contents.
//!
//! Every level of a table is read through [`InternalIterator`]: single
//! blocks, index readers and whole tables. [`TwoLevelIterator`] stitches an
//! index iterator to the blocks its values point at.

use crate::cache::CachableEntry;
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::sstable::block::{Block, BlockIter};
use std::sync::Arc;

/// A positioned, forward-only cursor over sorted entries.
///
/// # Example
///
/// ```rust
/// use blocktable::comparator::BytewiseComparator;
/// use blocktable::sstable::{Block, BlockBuilder, InternalIterator};
///
/// let mut builder = BlockBuilder::new(16, true);
/// builder.add(b"key1", b"value1");
/// builder.add(b"key2", b"value2");
/// let block = Block::new(builder.finish().into()).unwrap();
///
/// let mut iter = block.iter(BytewiseComparator::shared());
/// iter.seek_to_first();
/// while iter.valid() {
///     println!("{:?} => {:?}", iter.key(), iter.value());
///     iter.next();
/// }
/// ```
pub trait InternalIterator {
    /// Whether the iterator is positioned at an entry.
    fn valid(&self) -> bool;

    /// Positions at the first entry.
    fn seek_to_first(&mut self);

    /// Positions at the first entry with key `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Current key. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// First error encountered, if any. An invalid iterator with an `Ok`
    /// status is simply exhausted.
    fn status(&self) -> Result<()>;
}

/// Turns index values into blocks for [`TwoLevelIterator`].
pub trait BlockFetcher {
    /// Loads the block whose encoded handle is `handle_value`.
    fn fetch_block(&self, handle_value: &[u8]) -> Result<CachableEntry<Block>>;

    /// Order of the fetched blocks.
    fn comparator(&self) -> Arc<dyn Comparator>;

    /// Returning false makes a seek to `target` yield nothing.
    fn prefix_may_match(&self, _target: &[u8]) -> bool {
        true
    }
}

/// Iterates the blocks referenced by an index, in index order.
pub struct TwoLevelIterator<I, F> {
    index_iter: I,
    fetcher: F,
    data_iter: Option<BlockIter>,
    /// Keeps the current block pinned in the cache.
    data_entry: Option<CachableEntry<Block>>,
    data_handle: Vec<u8>,
    status: Option<Error>,
}

impl<I: InternalIterator, F: BlockFetcher> TwoLevelIterator<I, F> {
    /// Create an unpositioned iterator.
    pub fn new(index_iter: I, fetcher: F) -> Self {
        Self {
            index_iter,
            fetcher,
            data_iter: None,
            data_entry: None,
            data_handle: Vec::new(),
            status: None,
        }
    }

    /// The index-level iterator.
    pub fn index_iter(&self) -> &I {
        &self.index_iter
    }

    /// The block fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn clear_data(&mut self) {
        self.data_iter = None;
        self.data_entry = None;
        self.data_handle.clear();
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.clear_data();
            return;
        }
        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_handle == handle {
            // data_iter is already constructed with this block
            return;
        }
        let handle = handle.to_vec();
        match self.fetcher.fetch_block(&handle) {
            Ok(entry) => {
                self.data_iter = Some(entry.iter(self.fetcher.comparator()));
                self.data_entry = Some(entry);
                self.data_handle = handle;
            }
            Err(err) => {
                self.clear_data();
                self.status.get_or_insert(err);
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|d| d.valid())
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            if let Some(Err(err)) = self.data_iter.as_ref().map(|d| d.status()) {
                self.status.get_or_insert(err);
            }
            if self.status.is_some() || !self.index_iter.valid() {
                self.clear_data();
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_first();
            }
        }
    }
}

impl<I: InternalIterator, F: BlockFetcher> InternalIterator for TwoLevelIterator<I, F> {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.status = None;
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.status = None;
        if !self.fetcher.prefix_may_match(target) {
            self.clear_data();
            return;
        }
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        assert!(self.valid(), "Iterator not valid");
        if let Some(data) = self.data_iter.as_mut() {
            data.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn key(&self) -> &[u8] {
        match &self.data_iter {
            Some(data) => data.key(),
            None => panic!("Iterator not valid"),
        }
    }

    fn value(&self) -> &[u8] {
        match &self.data_iter {
            Some(data) => data.value(),
            None => panic!("Iterator not valid"),
        }
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
