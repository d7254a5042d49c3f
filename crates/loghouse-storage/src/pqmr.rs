//! Record Bitmaps and Persistent-Query Match Results
//!
//! A [`RecordBitmap`] marks record numbers of one block. Two features use it:
//! - time rollups, one bitmap per minute/hour/day bucket
//! - persistent-query match results, one bitmap per query id
//!
//! ## PQMR File Layout
//!
//! Each flushed block appends one entry to `<segkey>/pqmr/<pqid>.pqmr`:
//!
//! ```text
//! [blkNum u16][bitsetLen u16][bitset bytes]
//! ```
//!
//! Bits are little-endian within each byte: record `n` is bit `n % 8` of
//! byte `n / 8`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bitvec::prelude::{BitVec, Lsb0};
use bytes::BufMut;
use loghouse_core::bytes_ext::LeReader;

use crate::error::Result;

/// Growable set of record numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBitmap {
    bits: BitVec<u8, Lsb0>,
}

impl RecordBitmap {
    pub fn with_capacity(num_recs: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, num_recs),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(bytes),
        }
    }

    pub fn add_matched_record(&mut self, rec_num: u16) {
        let idx = rec_num as usize;
        if idx >= self.bits.len() {
            self.bits.resize(idx + 1, false);
        }
        self.bits.set(idx, true);
    }

    pub fn does_record_match(&self, rec_num: u16) -> bool {
        self.bits.get(rec_num as usize).map(|b| *b).unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    /// Clear every bit, keeping the allocation.
    pub fn reset_all(&mut self) {
        self.bits.fill(false);
    }

    /// Truncate or extend to exactly `num_recs` bits.
    pub fn shrink_to_records(&mut self, num_recs: usize) {
        self.bits.resize(num_recs, false);
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

/// `<segkey>/pqmr/<pqid>.pqmr`
pub fn pqmr_path(segkey: &str, pqid: &str) -> PathBuf {
    Path::new(segkey).join("pqmr").join(format!("{}.pqmr", pqid))
}

/// Append one block's match bitmap to a `.pqmr` file, creating its directory.
pub fn flush_pqmr(path: &Path, blk_num: u16, bitmap: &RecordBitmap) -> Result<usize> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let bytes = bitmap.as_bytes();
    let mut buf = Vec::with_capacity(4 + bytes.len());
    buf.put_u16_le(blk_num);
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);

    let mut fd = OpenOptions::new().create(true).append(true).open(path)?;
    fd.write_all(&buf)?;
    Ok(buf.len())
}

/// Read back every block entry of a `.pqmr` file.
pub fn read_pqmr(path: &Path) -> Result<BTreeMap<u16, RecordBitmap>> {
    let data = fs::read(path)?;
    let mut r = LeReader::new(&data);
    let mut blocks = BTreeMap::new();
    while !r.is_empty() {
        let blk_num = r.u16()?;
        let bitmap = RecordBitmap::from_bytes(r.u16_prefixed()?);
        blocks.insert(blk_num, bitmap);
    }
    Ok(blocks)
}
