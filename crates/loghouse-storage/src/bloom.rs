//! Block Bloom Index
//!
//! Every string column gets one bloom filter per WIP block so the query side
//! can skip blocks that definitely do not contain a search term.
//!
//! ## What Goes In
//!
//! For each value, [`BloomIndex::add_to_bloom_both_cases`] inserts:
//! - the full value as given
//! - each whitespace-separated sub-word, when the value has internal whitespace
//! - the lowercased full value and sub-words, only when the value has an
//!   uppercase ASCII letter
//!
//! The return value counts items that were not already present. That count
//! accumulates into `unique_word_count`, which sizes the next block's filter.
//!
//! ## Sizing
//!
//! The filter for block N+1 is sized to the average unique-word count of the
//! last [`BLOOM_SIZE_HISTORY`] blocks (100 with no history). Bool columns use
//! a fixed size of 10. The target false-positive rate is 0.1%.
//!
//! ## Serialized Form
//!
//! ```text
//! [num_bits u64][num_hashes u32][sip_keys 4 x u64][bitmap]
//! ```

use std::collections::VecDeque;

use bloomfilter::Bloom;
use bytes::BufMut;
use loghouse_core::bytes_ext::LeReader;

use crate::config::{BLOCK_BLOOM_SIZE, BLOOM_FP_RATE, BLOOM_SIZE_HISTORY, BOOL_BLOOM_SIZE};
use crate::error::Result;

/// Bloom filter over one column for one block, plus the sizing history
/// that survives across blocks.
pub struct BloomIndex {
    bloom: Bloom<[u8]>,
    unique_word_count: u32,
    bloom_size: usize,
    history: VecDeque<u32>,
}

impl std::fmt::Debug for BloomIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomIndex")
            .field("unique_word_count", &self.unique_word_count)
            .field("bloom_size", &self.bloom_size)
            .field("num_bits", &self.bloom.number_of_bits())
            .field("history", &self.history)
            .finish()
    }
}

fn new_filter(expected_items: usize) -> Bloom<[u8]> {
    Bloom::new_for_fp_rate(expected_items.max(1), BLOOM_FP_RATE)
}

impl BloomIndex {
    /// Create a filter expecting `expected_items` distinct words.
    pub fn new(expected_items: usize) -> Self {
        let bloom_size = expected_items.max(1);
        Self {
            bloom: new_filter(bloom_size),
            unique_word_count: 0,
            bloom_size,
            history: VecDeque::with_capacity(BLOOM_SIZE_HISTORY),
        }
    }

    /// Filter sized from the default block estimate.
    pub fn with_default_size() -> Self {
        Self::new(BLOCK_BLOOM_SIZE)
    }

    /// Small fixed-size filter for bool columns.
    pub fn for_bool() -> Self {
        Self::new(BOOL_BLOOM_SIZE)
    }

    /// Insert a value and its sub-words, returning how many were new.
    ///
    /// ## Example
    ///
    /// ```ignore
    /// let mut bi = BloomIndex::with_default_size();
    /// assert_eq!(bi.add_to_bloom_both_cases(b"many sub words"), 4);
    /// assert!(bi.might_contain(b"sub"));
    /// ```
    pub fn add_to_bloom_both_cases(&mut self, full_word: &[u8]) -> u32 {
        let mut added = self.add_word_and_subwords(full_word);
        if full_word.iter().any(u8::is_ascii_uppercase) {
            let lower = full_word.to_ascii_lowercase();
            added += self.add_word_and_subwords(&lower);
        }
        self.unique_word_count += added;
        added
    }

    fn add_word_and_subwords(&mut self, word: &[u8]) -> u32 {
        let mut added = 0;
        if !self.bloom.check_and_set(word) {
            added += 1;
        }
        if word.iter().any(u8::is_ascii_whitespace) {
            for sub in word.split(u8::is_ascii_whitespace) {
                if !sub.is_empty() && !self.bloom.check_and_set(sub) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn might_contain(&self, word: &[u8]) -> bool {
        self.bloom.check(word)
    }

    pub fn unique_word_count(&self) -> u32 {
        self.unique_word_count
    }

    pub fn bloom_size(&self) -> usize {
        self.bloom_size
    }

    pub fn history(&self) -> &VecDeque<u32> {
        &self.history
    }

    /// Average of the recorded history, or the default block size.
    pub fn next_block_size(&self) -> usize {
        if self.history.is_empty() {
            return BLOCK_BLOOM_SIZE;
        }
        let sum: u64 = self.history.iter().map(|&c| c as u64).sum();
        let next = (sum / self.history.len() as u64) as usize;
        next.max(1)
    }

    /// Record this block's unique-word count into the sizing history.
    pub fn record_block_count(&mut self) {
        if self.history.len() == BLOOM_SIZE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(self.unique_word_count);
    }

    /// Start a fresh filter for the next block, sized from history.
    pub fn reset_for_next_block(&mut self) {
        self.bloom_size = self.next_block_size();
        self.bloom = new_filter(self.bloom_size);
        self.unique_word_count = 0;
    }

    /// Serialized filter, see the module docs for the layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.bloom.bitmap();
        let sip_keys = self.bloom.sip_keys();
        let mut out = Vec::with_capacity(8 + 4 + 32 + bitmap.len());
        out.put_u64_le(self.bloom.number_of_bits());
        out.put_u32_le(self.bloom.number_of_hash_functions());
        out.put_u64_le(sip_keys[0].0);
        out.put_u64_le(sip_keys[0].1);
        out.put_u64_le(sip_keys[1].0);
        out.put_u64_le(sip_keys[1].1);
        out.put_slice(&bitmap);
        out
    }

    /// Rebuild a filter from [`BloomIndex::to_bytes`] output.
    ///
    /// The sizing history is not persisted, so the result starts with none.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = LeReader::new(data);
        let num_bits = r.u64()?;
        let num_hashes = r.u32()?;
        let sip_keys = [(r.u64()?, r.u64()?), (r.u64()?, r.u64()?)];
        let bitmap = r.take(r.remaining())?;
        let bloom = Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys);

        Ok(Self {
            bloom,
            unique_word_count: 0,
            bloom_size: 0,
            history: VecDeque::with_capacity(BLOOM_SIZE_HISTORY),
        })
    }
}
