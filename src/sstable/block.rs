//! Block format implementation for SSTable.
//!
//! A block contains multiple key-value entries and uses restart points
//! for efficient binary search and prefix compression.

use crate::coding::{decode_fixed32, decode_varint32, put_fixed32, put_varint32, varint_length};
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::sstable::iterator::InternalIterator;
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;

/// Block stores key-value pairs with prefix compression.
///
/// Format:
/// ```text
/// [Entry 1]
/// [Entry 2]
/// ...
/// [Entry N]
/// [Restart Point 1: u32]
/// [Restart Point 2: u32]
/// ...
/// [Restart Point M: u32]
/// [Num Restarts: u32]
/// ```
///
/// Each entry format:
/// ```text
/// [shared_key_len: varint32]   // Length of shared prefix with previous key
/// [unshared_key_len: varint32] // Length of unshared key suffix
/// [value_len: varint32]        // Length of value
/// [unshared_key: bytes]        // Key suffix
/// [value: bytes]               // Value data
/// ```
/// Entries at restart points always have `shared_key_len == 0`.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Create a new Block from raw, uncompressed contents.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("bad block contents: too small"));
        }

        let num_restarts = decode_fixed32(&data[data.len() - 4..])
            .ok_or_else(|| Error::corruption("bad block contents: missing restart count"))?;
        let max_restarts = (data.len() - 4) / 4;
        if num_restarts as usize > max_restarts {
            return Err(Error::corruption("bad block contents: restart array too large"));
        }

        // restart_offset = data_len - 4 (num_restarts) - 4 * num_restarts (restart points)
        let restart_offset = data.len() - 4 - num_restarts as usize * 4;

        Ok(Self { data, restart_offset, num_restarts })
    }

    /// Get the number of restart points
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    /// Get a restart point by index
    fn restart_point(&self, index: u32) -> usize {
        let offset = self.restart_offset + index as usize * 4;
        decode_fixed32(&self.data[offset..]).map_or(usize::MAX, |v| v as usize)
    }

    /// Create an iterator over the block
    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(self.clone(), comparator)
    }

    /// Get the raw data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the block contents in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// BlockBuilder builds a block with prefix compression.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    block_restart_interval: usize,
    use_delta_encoding: bool,
}

impl BlockBuilder {
    /// Create a new BlockBuilder
    pub fn new(block_restart_interval: usize, use_delta_encoding: bool) -> Self {
        assert!(block_restart_interval >= 1);
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            block_restart_interval,
            use_delta_encoding,
        }
    }

    /// Add a key-value pair to the block. Keys must arrive in comparator
    /// order; the table builder checks that.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter >= self.block_restart_interval {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        } else if self.use_delta_encoding {
            shared_prefix_len(&self.last_key, key)
        } else {
            0
        };
        let unshared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, unshared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        self.counter += 1;
    }

    /// Appends the restart array and returns the block contents. The builder
    /// is reset and can start a new block.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buffer);
        for restart in &self.restarts {
            put_fixed32(&mut out, *restart);
        }
        put_fixed32(&mut out, self.restarts.len() as u32);
        self.reset();
        out
    }

    /// Drops every entry.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
    }

    /// Size the block would have if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Size the block would have after adding `key`/`value`.
    pub fn estimate_size_after_kv(&self, key: &[u8], value: &[u8]) -> usize {
        let mut estimate = self.current_size_estimate();
        let shared = if self.counter >= self.block_restart_interval {
            estimate += 4;
            0
        } else if self.use_delta_encoding {
            shared_prefix_len(&self.last_key, key)
        } else {
            0
        };
        let unshared = key.len() - shared;
        estimate += varint_length(shared as u64) + varint_length(unshared as u64) + varint_length(value.len() as u64);
        estimate + unshared + value.len()
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Calculate the length of the shared prefix
fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Decoded entry header.
struct EntryHeader {
    shared: usize,
    unshared: usize,
    value_len: usize,
    /// Offset of the key suffix relative to the entry start.
    header_len: usize,
}

fn decode_entry(data: &[u8]) -> Option<EntryHeader> {
    if data.len() < 3 {
        return None;
    }
    let (shared, unshared, value_len, header_len) = if (data[0] | data[1] | data[2]) < 128 {
        // Fast path: all three values are encoded in one byte each
        (data[0] as usize, data[1] as usize, data[2] as usize, 3)
    } else {
        let (shared, n1) = decode_varint32(data)?;
        let (unshared, n2) = decode_varint32(&data[n1..])?;
        let (value_len, n3) = decode_varint32(&data[n1 + n2..])?;
        (shared as usize, unshared as usize, value_len as usize, n1 + n2 + n3)
    };
    if data.len() - header_len < unshared + value_len {
        return None;
    }
    Some(EntryHeader { shared, unshared, value_len, header_len })
}

/// Iterator over entries in a block
pub struct BlockIter {
    block: Block,
    comparator: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` when invalid.
    current: usize,
    next_offset: usize,
    restart_index: u32,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    status: Option<Error>,
}

impl BlockIter {
    fn new(block: Block, comparator: Arc<dyn Comparator>) -> Self {
        let end = block.restart_offset;
        Self {
            block,
            comparator,
            current: end,
            next_offset: end,
            restart_index: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            status: None,
        }
    }

    /// Positions before the entry at restart point `index`; the following
    /// [`next`](InternalIterator::next) lands on it.
    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.next_offset = self.block.restart_point(index);
    }

    fn mark_invalid(&mut self) {
        self.current = self.block.restart_offset;
        self.next_offset = self.block.restart_offset;
        self.restart_index = self.block.num_restarts;
    }

    fn corruption(&mut self) {
        self.mark_invalid();
        self.key.clear();
        self.status = Some(Error::corruption("bad entry in block"));
    }

    /// Parse the entry at `next_offset`. Returns false at the end of the
    /// block or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_offset;
        if self.current >= self.block.restart_offset {
            self.mark_invalid();
            return false;
        }

        let Some(header) = decode_entry(&self.block.data[self.current..self.block.restart_offset]) else {
            self.corruption();
            return false;
        };
        if header.shared > self.key.len() {
            self.corruption();
            return false;
        }

        let key_start = self.current + header.header_len;
        self.key.truncate(header.shared);
        self.key.extend_from_slice(&self.block.data[key_start..key_start + header.unshared]);
        self.value_start = key_start + header.unshared;
        self.value_len = header.value_len;
        self.next_offset = self.value_start + self.value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Key stored at restart point `index`.
    fn restart_key(&self, index: u32) -> Option<&[u8]> {
        let offset = self.block.restart_point(index);
        if offset >= self.block.restart_offset {
            return None;
        }
        let header = decode_entry(&self.block.data[offset..self.block.restart_offset])?;
        if header.shared != 0 {
            return None;
        }
        let start = offset + header.header_len;
        Some(&self.block.data[start..start + header.unshared])
    }

    /// Seeks to the first entry `>= target` considering only restart points
    /// in `[left, right]` for the binary search step.
    fn binary_seek(&mut self, target: &[u8], mut left: u32, mut right: u32) {
        while left < right {
            let mid = left + (right - left).div_ceil(2);
            let Some(mid_key) = self.restart_key(mid) else {
                self.corruption();
                return;
            };
            if self.comparator.compare(mid_key, target) == Ordering::Less {
                // Key at "mid" is smaller than "target". Therefore all
                // blocks before "mid" are uninteresting.
                left = mid;
            } else {
                // Key at "mid" is >= "target". Therefore all blocks at or
                // after "mid" are uninteresting.
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        // Linear search (within restart block) for first key >= target
        while self.parse_next_entry() {
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Seek using only the restart points `[first, first + count)` as
    /// candidates; entries after the range are still visited if nothing in
    /// it is `>= target`.
    pub fn seek_in_restart_range(&mut self, target: &[u8], first: u32, count: u32) {
        self.status = None;
        if count == 0 || first >= self.block.num_restarts {
            self.mark_invalid();
            return;
        }
        let last = (first + count - 1).min(self.block.num_restarts - 1);
        self.binary_seek(target, first, last);
    }

    /// Restart point of the current entry.
    pub fn restart_index(&self) -> u32 {
        self.restart_index
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        self.status = None;
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.status = None;
        if self.block.num_restarts == 0 {
            self.mark_invalid();
            return;
        }
        self.binary_seek(target, 0, self.block.num_restarts - 1);
    }

    fn next(&mut self) {
        assert!(self.valid(), "Iterator not valid");
        self.parse_next_entry();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid(), "Iterator not valid");
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid(), "Iterator not valid");
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
