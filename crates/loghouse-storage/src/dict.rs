//! Dictionary Encoding
//!
//! Low-cardinality columns are stored as a dictionary: each distinct encoded
//! value once, followed by the record numbers that hold it.
//!
//! ## Equality
//!
//! Two values are the same dictionary word iff their TLV encodings are
//! byte-identical, so `"1"` (string) and `1` (uint8) are distinct words.
//!
//! ## Cardinality Ceiling
//!
//! Once the number of words reaches the ceiling, nothing more is added, not
//! even record numbers for words already present. The column keeps its raw
//! per-record buffer either way; the dictionary is only usable at flush when
//! `0 < count < ceiling`.
//!
//! ## Packed Form
//!
//! ```text
//! [numWords u16] { [word TLV][numRecs u16][recNum u16]* }*
//! ```
//!
//! Words are written in first-seen order.
//!
//! ## Abandoned Dictionaries
//!
//! A column that stores some values without dictionary entries (dictionary
//! encoding switched off for the store) abandons its dictionary for the rest
//! of the block, so a partial dictionary is never mistaken for a complete one.

use std::collections::HashMap;

use bytes::BufMut;
use loghouse_core::bytes_ext::LeReader;
use loghouse_core::{tlv_len, ValueTag};

use crate::error::{Error, Result};

const BACKFILL_WORD: [u8; 1] = [ValueTag::Backfill as u8];

/// Per-column dictionary built while a block fills.
#[derive(Debug, Clone)]
pub struct DictEncoder {
    words: Vec<(Vec<u8>, Vec<u16>)>,
    index: HashMap<Vec<u8>, usize>,
    ceiling: u16,
    abandoned: bool,
}

impl DictEncoder {
    pub fn new(ceiling: u16) -> Self {
        Self {
            words: Vec::new(),
            index: HashMap::new(),
            ceiling,
            abandoned: false,
        }
    }

    /// Record that `rec_num` holds the value encoded as `tlv`.
    ///
    /// A no-op once the ceiling is reached.
    pub fn check_add_dict_entry(&mut self, tlv: &[u8], rec_num: u16) {
        if self.abandoned || self.count() >= self.ceiling {
            return;
        }
        match self.index.get(tlv) {
            Some(&i) => self.words[i].1.push(rec_num),
            None => {
                self.index.insert(tlv.to_vec(), self.words.len());
                self.words.push((tlv.to_vec(), vec![rec_num]));
            }
        }
    }

    /// Record records `0..rec_count` as backfilled, for a column that first
    /// appears after the block already holds records.
    pub fn add_backfill_prefix(&mut self, rec_count: u16) {
        if self.abandoned || self.count() >= self.ceiling {
            return;
        }
        let recs: Vec<u16> = (0..rec_count).collect();
        match self.index.get(&BACKFILL_WORD[..]) {
            Some(&i) => self.words[i].1.extend(recs),
            None => {
                self.index.insert(BACKFILL_WORD.to_vec(), self.words.len());
                self.words.push((BACKFILL_WORD.to_vec(), recs));
            }
        }
    }

    pub fn add_backfill(&mut self, rec_num: u16) {
        self.check_add_dict_entry(&BACKFILL_WORD, rec_num);
    }

    pub fn count(&self) -> u16 {
        self.words.len() as u16
    }

    pub fn ceiling(&self) -> u16 {
        self.ceiling
    }

    /// True when every record of the block is reflected in the dictionary.
    pub fn is_usable(&self) -> bool {
        let count = self.count();
        !self.abandoned && count > 0 && count < self.ceiling
    }

    /// Stop tracking this block: drop all words and refuse new ones until
    /// [`DictEncoder::clear`].
    pub fn abandon(&mut self) {
        self.words.clear();
        self.index.clear();
        self.abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Words and their record lists, in first-seen order.
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u16])> {
        self.words.iter().map(|(w, r)| (w.as_slice(), r.as_slice()))
    }

    /// Drop every word. Must run between blocks so no stale word survives.
    pub fn clear(&mut self) {
        self.words.clear();
        self.index.clear();
        self.abandoned = false;
    }

    /// Serialize into `out`, which is cleared first.
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.clear();
        out.put_u16_le(self.count());
        for (word, recs) in &self.words {
            out.put_slice(word);
            out.put_u16_le(recs.len() as u16);
            for &r in recs {
                out.put_u16_le(r);
            }
        }
    }
}

/// Reader for one packed dictionary block.
///
/// Each call to [`DictBlockReader::read_dict_enc`] replaces the previous
/// block's words and record mapping entirely.
#[derive(Debug, Clone, Default)]
pub struct DictBlockReader {
    words: Vec<Vec<u8>>,
    rec_to_word: Vec<u16>,
}

impl DictBlockReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a packed dictionary for a block holding `rec_count` records.
    ///
    /// ## Errors
    ///
    /// Fails on an undecodable word or a truncated buffer. Record numbers at
    /// or beyond `rec_count` are skipped and reported once all words are read.
    pub fn read_dict_enc(&mut self, buf: &[u8], rec_count: u16) -> Result<()> {
        let mut r = LeReader::new(buf);
        let num_words = r.u16()? as usize;

        self.words.clear();
        self.words.reserve(num_words);
        self.rec_to_word.clear();
        self.rec_to_word.resize(rec_count as usize, 0);

        let mut out_of_range = 0usize;
        let mut first_bad = None;
        for w in 0..num_words {
            let rest = &buf[r.position()..];
            let wlen = tlv_len(rest)?;
            self.words.push(r.take(wlen)?.to_vec());

            let num_recs = r.u16()?;
            for _ in 0..num_recs {
                let rec = r.u16()?;
                match self.rec_to_word.get_mut(rec as usize) {
                    Some(slot) => *slot = w as u16,
                    None => {
                        out_of_range += 1;
                        first_bad.get_or_insert(rec);
                    }
                }
            }
        }

        if let Some(rec) = first_bad {
            tracing::error!(
                errors = out_of_range,
                rec_num = rec,
                rec_count,
                "Dictionary record number beyond block record count"
            );
            return Err(Error::MalformedRecord(format!(
                "recNum {} exceeds the {} records of the block",
                rec, rec_count
            )));
        }
        Ok(())
    }

    pub fn words(&self) -> &[Vec<u8>] {
        &self.words
    }

    pub fn rec_to_word(&self) -> &[u16] {
        &self.rec_to_word
    }

    /// Encoded value of record `rec_num`.
    pub fn word_for_record(&self, rec_num: u16) -> Option<&[u8]> {
        let w = *self.rec_to_word.get(rec_num as usize)?;
        self.words.get(w as usize).map(Vec::as_slice)
    }
}
