//! Bloom Filter implementation.
//!
//! A space-efficient probabilistic data structure used to test whether an element
//! is a member of a set. False positive matches are possible, but false negatives are not.

use crate::coding::{decode_fixed32, put_fixed32};
use crate::error::{Error, Result};
use crate::filter::{Filter, FilterPolicy};
use std::hash::Hasher;

/// Default bits per key for bloom filter
pub const DEFAULT_BITS_PER_KEY: usize = 10;

/// Bytes appended after the bit array: probe count (1) and bit count (4).
const TRAILER_LEN: usize = 5;

const SEED1: u32 = 0xbc9f1d34;
const SEED2: u32 = 0xd0e89c7b;

/// BloomFilter provides probabilistic set membership testing.
///
/// Encoded form:
/// ```text
/// [bits: (num_bits + 7) / 8 bytes][num_probes: u8][num_bits: u32]
/// ```
///
/// # Example
/// ```
/// use blocktable::filter::{BloomFilter, Filter};
///
/// let mut filter = BloomFilter::with_bits_per_key(1000, 10);
/// filter.add(b"key1");
/// filter.add(b"key2");
///
/// assert!(filter.may_contain(b"key1"));
/// assert!(filter.may_contain(b"key2"));
/// ```
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_probes: u32,
    num_bits: usize,
}

impl BloomFilter {
    /// Create a BloomFilter sized for `num_keys` at `bits_per_key`, with the
    /// probe count derived from the bit budget.
    pub fn with_bits_per_key(num_keys: usize, bits_per_key: usize) -> Self {
        Self::with_probes(num_keys, bits_per_key, probes_for_bits_per_key(bits_per_key))
    }

    /// Create a BloomFilter with an explicit probe count.
    pub fn with_probes(num_keys: usize, bits_per_key: usize, num_probes: u32) -> Self {
        // Small filters have a high false positive rate; keep a floor.
        let num_bits = (num_keys * bits_per_key).max(64);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_probes: num_probes.clamp(1, 30),
            num_bits,
        }
    }

    /// Get the size of the bit array in bytes.
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Get the number of probes per key.
    pub fn num_probes(&self) -> u32 {
        self.num_probes
    }

    /// Get the number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Theoretical false positive rate after `num_keys` insertions:
    /// p = (1 - e^(-kn/m))^k
    pub fn estimated_false_positive_rate(&self, num_keys: usize) -> f64 {
        if num_keys == 0 {
            return 0.0;
        }
        let k = self.num_probes as f64;
        let n = num_keys as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Probes an encoded filter without copying it.
    ///
    /// An empty filter matches nothing. A malformed one matches everything,
    /// so a damaged filter can cost reads but never lose keys.
    pub fn may_contain_encoded(filter: &[u8], key: &[u8]) -> bool {
        if filter.is_empty() {
            return false;
        }
        let Some((bits, num_probes, num_bits)) = split_encoded(filter) else {
            return true;
        };
        probe_positions(key, num_probes, num_bits).all(|pos| bit_is_set(bits, pos))
    }
}

fn probes_for_bits_per_key(bits_per_key: usize) -> u32 {
    // 0.69 ~= ln(2)
    ((bits_per_key as f64) * 0.69).round() as u32
}

fn split_encoded(filter: &[u8]) -> Option<(&[u8], u32, usize)> {
    let body_len = filter.len().checked_sub(TRAILER_LEN)?;
    let (bits, trailer) = filter.split_at(body_len);
    let num_probes = trailer[0] as u32;
    let num_bits = decode_fixed32(&trailer[1..])? as usize;
    if num_bits == 0 || num_probes == 0 || num_bits.div_ceil(8) != bits.len() {
        return None;
    }
    Some((bits, num_probes, num_bits))
}

/// Double hashing: position_i = h1 + i * h2 (mod m).
fn probe_positions(key: &[u8], num_probes: u32, num_bits: usize) -> impl Iterator<Item = usize> {
    let h1 = hash_with_seed(key, SEED1);
    let h2 = hash_with_seed(key, SEED2);
    (0..num_probes).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) as usize) % num_bits)
}

fn hash_with_seed(key: &[u8], seed: u32) -> u32 {
    let mut hasher = FnvHasher::new_with_seed(seed);
    hasher.write(key);
    fmix64(hasher.finish()) as u32
}

/// Avalanche step so both seeded hashes use all 64 bits of FNV state.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^ (h >> 33)
}

fn bit_is_set(bits: &[u8], pos: usize) -> bool {
    (bits[pos / 8] & (1 << (pos % 8))) != 0
}

impl Filter for BloomFilter {
    fn may_contain(&self, key: &[u8]) -> bool {
        probe_positions(key, self.num_probes, self.num_bits).all(|pos| bit_is_set(&self.bits, pos))
    }

    fn add(&mut self, key: &[u8]) {
        for pos in probe_positions(key, self.num_probes, self.num_bits) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.bits.len() + TRAILER_LEN);
        encoded.extend_from_slice(&self.bits);
        encoded.push(self.num_probes as u8);
        put_fixed32(&mut encoded, self.num_bits as u32);
        encoded
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (bits, num_probes, num_bits) =
            split_encoded(data).ok_or_else(|| Error::corruption("Bloom filter size mismatch"))?;
        Ok(Self { bits: bits.to_vec(), num_probes, num_bits })
    }
}

/// Simple FNV-1a hasher for Bloom Filter
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn new_with_seed(seed: u32) -> Self {
        Self { state: Self::FNV_OFFSET_BASIS ^ (seed as u64) }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::FNV_PRIME);
        }
    }
}

/// The built-in bloom filter policy.
#[derive(Debug, Clone)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_probes: u32,
    use_block_based_builder: bool,
}

impl BloomFilterPolicy {
    /// Full-file (or partitioned) filters with `bits_per_key` bits per key.
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key: bits_per_key.max(1),
            num_probes: probes_for_bits_per_key(bits_per_key).clamp(1, 30),
            use_block_based_builder: false,
        }
    }

    /// One filter per data block instead of one per file.
    pub fn block_based(bits_per_key: usize) -> Self {
        Self { use_block_based_builder: true, ..Self::new(bits_per_key) }
    }

    /// Overrides the number of probes per key.
    pub fn with_num_probes(mut self, num_probes: u32) -> Self {
        self.num_probes = num_probes.clamp(1, 30);
        self
    }

    /// Bits allocated per key.
    pub fn bits_per_key(&self) -> usize {
        self.bits_per_key
    }

    /// Probes per key.
    pub fn num_probes(&self) -> u32 {
        self.num_probes
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BITS_PER_KEY)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "rocksdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let mut filter = BloomFilter::with_probes(keys.len(), self.bits_per_key, self.num_probes);
        for key in keys {
            filter.add(key);
        }
        dst.extend_from_slice(&filter.encode());
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        BloomFilter::may_contain_encoded(filter, key)
    }

    fn use_block_based_builder(&self) -> bool {
        self.use_block_based_builder
    }
}
