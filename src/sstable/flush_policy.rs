//! Decides when the table builder cuts a data block.

use crate::config::TableOptions;
use crate::sstable::block::BlockBuilder;

/// Asked before every key is added to a data block.
pub trait FlushBlockPolicy: Send {
    /// Returns true if `block` should be flushed before `key`/`value` is
    /// added to it.
    fn update(&mut self, block: &BlockBuilder, key: &[u8], value: &[u8]) -> bool;
}

/// Creates a [`FlushBlockPolicy`] per table.
pub trait FlushBlockPolicyFactory: Send + Sync {
    /// Factory name.
    fn name(&self) -> &str;

    /// A fresh policy for a table built with `options`.
    fn new_policy(&self, options: &TableOptions) -> Box<dyn FlushBlockPolicy>;
}

/// Cuts blocks once they reach `block_size`, allowing a block to overshoot
/// by `block_size_deviation` percent when the next entry would otherwise
/// leave it much too small.
#[derive(Debug, Clone)]
pub struct FlushBlockBySizePolicy {
    block_size: usize,
    block_size_deviation: usize,
}

impl FlushBlockBySizePolicy {
    /// Create a policy. `block_size_deviation` is a percentage in `0..=100`.
    pub fn new(block_size: usize, block_size_deviation: usize) -> Self {
        Self { block_size, block_size_deviation }
    }

    fn block_almost_full(&self, block: &BlockBuilder, key: &[u8], value: &[u8]) -> bool {
        if self.block_size_deviation == 0 {
            return false;
        }
        let curr_size = block.current_size_estimate();
        let estimated_size_after = block.estimate_size_after_kv(key, value);

        let limit = self.block_size as u128 * (100 + self.block_size_deviation) as u128 / 100;
        if estimated_size_after as u128 > limit {
            return true;
        }
        // Cut if the entry overshoots the target by at least as much as we
        // would undershoot it by cutting now.
        self.block_size - curr_size <= estimated_size_after - self.block_size
    }
}

impl FlushBlockPolicy for FlushBlockBySizePolicy {
    fn update(&mut self, block: &BlockBuilder, key: &[u8], value: &[u8]) -> bool {
        // It makes no sense to flush when the data block is empty
        if block.is_empty() {
            return false;
        }
        let curr_size = block.current_size_estimate();
        if curr_size >= self.block_size {
            return true;
        }
        let estimated_size_after = block.estimate_size_after_kv(key, value);
        if estimated_size_after <= self.block_size {
            return false;
        }
        // Overshooting with no tolerance always cuts.
        if self.block_size_deviation == 0 {
            return true;
        }
        self.block_almost_full(block, key, value)
    }
}

/// Factory for [`FlushBlockBySizePolicy`] configured from
/// [`TableOptions::block_size`] and [`TableOptions::block_size_deviation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushBlockBySizePolicyFactory;

impl FlushBlockPolicyFactory for FlushBlockBySizePolicyFactory {
    fn name(&self) -> &str {
        "FlushBlockBySizePolicyFactory"
    }

    fn new_policy(&self, options: &TableOptions) -> Box<dyn FlushBlockPolicy> {
        Box::new(FlushBlockBySizePolicy::new(options.block_size, options.block_size_deviation))
    }
}
