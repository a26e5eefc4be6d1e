//! A single filter covering every key of a table (or of one partition).

use crate::comparator::SliceTransform;
use crate::filter::FilterPolicy;
use bytes::Bytes;
use std::sync::Arc;

/// Collects keys and builds one filter at the end.
pub struct FullFilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    keys: Vec<u8>,
    starts: Vec<usize>,
    last_whole_key: Option<Vec<u8>>,
    last_prefix: Option<Vec<u8>>,
}

impl FullFilterBlockBuilder {
    /// Create an empty builder.
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
            last_whole_key: None,
            last_prefix: None,
        }
    }

    /// Adds `key`, its prefix, or both.
    pub fn add(&mut self, key: &[u8]) {
        if self.whole_key_filtering && self.last_whole_key.as_deref() != Some(key) {
            self.last_whole_key = Some(key.to_vec());
            self.add_entry(key);
        }
        if let Some(extractor) = self.prefix_extractor.clone() {
            if extractor.in_domain(key) {
                let prefix = extractor.transform(key);
                if self.last_prefix.as_deref() != Some(prefix) {
                    self.last_prefix = Some(prefix.to_vec());
                    self.add_entry(prefix);
                }
            }
        }
    }

    fn add_entry(&mut self, entry: &[u8]) {
        self.starts.push(self.keys.len());
        self.keys.extend_from_slice(entry);
    }

    /// Number of filter entries added since the last `finish`.
    pub fn num_added(&self) -> usize {
        self.starts.len()
    }

    /// Builds the filter and resets the builder. No entries yields an empty
    /// filter, which matches nothing.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.starts.is_empty() {
            return out;
        }
        let mut ends = self.starts[1..].to_vec();
        ends.push(self.keys.len());
        let entries: Vec<&[u8]> = self.starts.iter().zip(&ends).map(|(&s, &e)| &self.keys[s..e]).collect();
        self.policy.create_filter(&entries, &mut out);

        self.keys.clear();
        self.starts.clear();
        self.last_whole_key = None;
        self.last_prefix = None;
        out
    }
}

/// Probes a full filter.
pub struct FullFilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    contents: Bytes,
}

impl FullFilterBlockReader {
    /// Wrap filter `contents`.
    pub fn new(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
        contents: Bytes,
    ) -> Self {
        Self { policy, prefix_extractor, whole_key_filtering, contents }
    }

    /// Whether the table may contain `key`.
    pub fn key_may_match(&self, key: &[u8]) -> bool {
        if !self.whole_key_filtering {
            return true;
        }
        self.may_match(key)
    }

    /// Whether the table may contain keys starting with `prefix`.
    pub fn prefix_may_match(&self, prefix: &[u8]) -> bool {
        if self.prefix_extractor.is_none() {
            return true;
        }
        self.may_match(prefix)
    }

    fn may_match(&self, entry: &[u8]) -> bool {
        if self.contents.is_empty() {
            return false;
        }
        self.policy.key_may_match(entry, &self.contents)
    }

    /// Heap bytes held by the reader.
    pub fn approximate_memory_usage(&self) -> usize {
        self.contents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::FixedPrefixTransform;
    use crate::filter::BloomFilterPolicy;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let mut builder = FullFilterBlockBuilder::new(policy(), None, true);
        let contents = builder.finish();
        assert!(contents.is_empty());

        let reader = FullFilterBlockReader::new(policy(), None, true, Bytes::from(contents));
        assert!(!reader.key_may_match(b"foo"));
    }

    #[test]
    fn test_single_chunk() {
        let mut builder = FullFilterBlockBuilder::new(policy(), None, true);
        for key in [&b"foo"[..], b"bar", b"box", b"box", b"hello"] {
            builder.add(key);
        }
        // Adjacent duplicates are collapsed.
        assert_eq!(builder.num_added(), 4);

        let reader = FullFilterBlockReader::new(policy(), None, true, Bytes::from(builder.finish()));
        for key in [&b"foo"[..], b"bar", b"box", b"hello"] {
            assert!(reader.key_may_match(key));
        }
        assert!(!reader.key_may_match(b"missing"));
        assert!(!reader.key_may_match(b"other"));
        assert_eq!(builder.num_added(), 0);
    }

    #[test]
    fn test_prefix_dedup() {
        let extractor: Arc<dyn SliceTransform> = Arc::new(FixedPrefixTransform::new(3));
        let mut builder = FullFilterBlockBuilder::new(policy(), Some(extractor.clone()), true);
        builder.add(b"abc1");
        builder.add(b"abc2");
        builder.add(b"abd1");
        builder.add(b"z");
        // 4 whole keys plus prefixes "abc" and "abd"; "z" is out of domain.
        assert_eq!(builder.num_added(), 6);

        let reader = FullFilterBlockReader::new(policy(), Some(extractor), true, Bytes::from(builder.finish()));
        assert!(reader.prefix_may_match(b"abc"));
        assert!(reader.prefix_may_match(b"abd"));
        assert!(reader.key_may_match(b"z"));
        assert!(!reader.prefix_may_match(b"xyz"));
    }
}
