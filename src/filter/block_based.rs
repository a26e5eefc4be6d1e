//! One filter per 2KB range of data block offsets.
//!
//! Layout:
//! ```text
//! [filter 0][filter 1]...[filter N-1]
//! [offset of filter 0: u32]...[offset of filter N-1: u32]
//! [offset of the offset array: u32]
//! [base_lg: u8]
//! ```
//! Filter `i` covers data blocks starting in `[i << base_lg, (i + 1) << base_lg)`.

use crate::coding::{decode_fixed32, put_fixed32};
use crate::comparator::SliceTransform;
use crate::filter::FilterPolicy;
use bytes::Bytes;
use std::sync::Arc;

/// Each filter covers 2^11 = 2KB of data block offsets.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Builds the per-block filter section.
pub struct BlockBasedFilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    /// Flattened keys for the filter being accumulated.
    keys: Vec<u8>,
    starts: Vec<usize>,
    last_prefix: Option<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl BlockBasedFilterBlockBuilder {
    /// Create a builder. The first data block starts at offset zero.
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
    ) -> Self {
        Self {
            policy,
            prefix_extractor,
            whole_key_filtering,
            keys: Vec::new(),
            starts: Vec::new(),
            last_prefix: None,
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called when a new data block begins at `block_offset`.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Adds a key of the current data block.
    pub fn add(&mut self, key: &[u8]) {
        if self.whole_key_filtering {
            self.add_key(key);
        }
        if let Some(extractor) = self.prefix_extractor.clone() {
            if extractor.in_domain(key) {
                let prefix = extractor.transform(key);
                if self.last_prefix.as_deref() != Some(prefix) {
                    self.last_prefix = Some(prefix.to_vec());
                    self.add_key(prefix);
                }
            }
        }
    }

    fn add_key(&mut self, key: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Whether no key has been added since the last filter was generated.
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.filter_offsets.is_empty()
    }

    /// Serializes every filter plus the offset array.
    pub fn finish(&mut self) -> Vec<u8> {
        if !self.starts.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        let mut out = std::mem::take(&mut self.result);
        for offset in &self.filter_offsets {
            put_fixed32(&mut out, *offset);
        }
        put_fixed32(&mut out, array_offset);
        out.push(FILTER_BASE_LG);
        self.filter_offsets.clear();
        out
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.starts.is_empty() {
            // Fast path: no keys for this filter.
            return;
        }

        let mut ends = self.starts[1..].to_vec();
        ends.push(self.keys.len());
        let keys: Vec<&[u8]> = self.starts.iter().zip(&ends).map(|(&s, &e)| &self.keys[s..e]).collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.starts.clear();
        self.last_prefix = None;
    }
}

/// Reads a block-based filter section.
pub struct BlockBasedFilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    data: Bytes,
    /// Start of the offset array.
    offset: usize,
    num: usize,
    base_lg: u8,
}

impl BlockBasedFilterBlockReader {
    /// Parses `contents`. Malformed contents yield a reader that matches
    /// every key.
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        contents: Bytes,
    ) -> Self {
        let mut reader = Self {
            policy,
            prefix_extractor,
            whole_key_filtering,
            data: contents,
            offset: 0,
            num: 0,
            base_lg: 0,
        };
        let n = reader.data.len();
        // 1 byte for base_lg and 4 for the start of the offset array.
        if n < 5 {
            return reader;
        }
        reader.base_lg = reader.data[n - 1];
        if u32::from(reader.base_lg) >= u64::BITS {
            return reader;
        }
        let Some(last_word) = decode_fixed32(&reader.data[n - 5..]) else {
            return reader;
        };
        let last_word = last_word as usize;
        if last_word > n - 5 {
            return reader;
        }
        reader.offset = last_word;
        reader.num = (n - 5 - last_word) / 4;
        reader
    }

    /// Whether the data block at `block_offset` may contain `key`.
    pub fn key_may_match(&self, key: &[u8], block_offset: u64) -> bool {
        if !self.whole_key_filtering {
            return true;
        }
        self.may_match(key, block_offset)
    }

    /// Whether the data block at `block_offset` may contain keys with `prefix`.
    pub fn prefix_may_match(&self, prefix: &[u8], block_offset: u64) -> bool {
        if self.prefix_extractor.is_none() {
            return true;
        }
        self.may_match(prefix, block_offset)
    }

    fn may_match(&self, entry: &[u8], block_offset: u64) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num {
            // Errors are treated as potential matches.
            return true;
        }
        let at = self.offset + index * 4;
        let (Some(start), Some(limit)) = (decode_fixed32(&self.data[at..]), decode_fixed32(&self.data[at + 4..]))
        else {
            return true;
        };
        let (start, limit) = (start as usize, limit as usize);
        if start < limit && limit <= self.offset {
            self.policy.key_may_match(entry, &self.data[start..limit])
        } else if start == limit {
            // Empty filters do not match any keys.
            false
        } else {
            true
        }
    }

    /// Heap bytes held by the reader.
    pub fn approximate_memory_usage(&self) -> usize {
        self.data.len()
    }
}
