//! Block Summaries
//!
//! Every flushed block appends one entry to `<segkey>.bsu` describing the
//! block's time range, record count and where each column's block landed in
//! its `.csg` file:
//!
//! ```text
//! [summaryLen u32][blkNum u16][highTs u64][lowTs u64][recCount u16][numCols u16]
//! { [cnameLen u16][cname][blkOffset u64][blkLen u32] } x numCols
//! ```
//!
//! `summaryLen` covers the whole entry, itself included.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use loghouse_core::bytes_ext::{patch_u32, put_u16_prefixed, LeReader};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Time range and size of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub high_ts: u64,
    pub low_ts: u64,
    pub rec_count: u16,
}

impl BlockSummary {
    /// Widen the range to include `ts_ms`. Zero means "unset".
    pub fn adjust_earliest_latest(&mut self, ts_ms: u64) {
        if self.low_ts == 0 || ts_ms < self.low_ts {
            self.low_ts = ts_ms;
        }
        if self.high_ts == 0 || ts_ms > self.high_ts {
            self.high_ts = ts_ms;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Where each column's block of the current flush was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadataHolder {
    pub blk_num: u16,
    pub column_block_offset: BTreeMap<String, u64>,
    pub column_block_len: BTreeMap<String, u32>,
}

impl BlockMetadataHolder {
    pub fn new(blk_num: u16) -> Self {
        Self {
            blk_num,
            ..Default::default()
        }
    }

    pub fn record_column(&mut self, cname: &str, offset: u64, len: u32) {
        self.column_block_offset.insert(cname.to_string(), offset);
        self.column_block_len.insert(cname.to_string(), len);
    }
}

pub fn bsu_path(segkey: &str) -> PathBuf {
    PathBuf::from(format!("{}.bsu", segkey))
}

/// Append the encoded summary for `blk_num` to `out`.
pub fn encode_block_summary(
    bmh: &BlockMetadataHolder,
    bsum: &BlockSummary,
    blk_num: u16,
    out: &mut Vec<u8>,
) -> Result<usize> {
    let start = out.len();
    out.put_u32_le(0);
    out.put_u16_le(blk_num);
    out.put_u64_le(bsum.high_ts);
    out.put_u64_le(bsum.low_ts);
    out.put_u16_le(bsum.rec_count);
    out.put_u16_le(bmh.column_block_offset.len() as u16);
    for (cname, offset) in &bmh.column_block_offset {
        put_u16_prefixed(out, cname.as_bytes())?;
        out.put_u64_le(*offset);
        out.put_u32_le(bmh.column_block_len.get(cname).copied().unwrap_or(0));
    }
    let len = out.len() - start;
    patch_u32(out, start, len as u32);
    Ok(len)
}

/// Append one block summary to the `.bsu` file.
pub fn flush_block_summary(
    path: &Path,
    bmh: &BlockMetadataHolder,
    bsum: &BlockSummary,
    blk_num: u16,
) -> Result<usize> {
    let mut buf = Vec::new();
    let len = encode_block_summary(bmh, bsum, blk_num, &mut buf)?;
    let mut fd = OpenOptions::new().create(true).append(true).open(path)?;
    fd.write_all(&buf)?;
    Ok(len)
}

/// Read every summary of a `.bsu` file, in block order.
pub fn read_block_summaries(path: &Path) -> Result<Vec<(BlockSummary, BlockMetadataHolder)>> {
    let data = std::fs::read(path)?;
    let mut r = LeReader::new(&data);
    let mut out = Vec::new();
    while !r.is_empty() {
        let total = r.u32()? as usize;
        let mut er = LeReader::new(r.take(total.saturating_sub(4))?);
        let blk_num = er.u16()?;
        let high_ts = er.u64()?;
        let low_ts = er.u64()?;
        let rec_count = er.u16()?;
        let num_cols = er.u16()?;
        let mut bmh = BlockMetadataHolder::new(blk_num);
        for _ in 0..num_cols {
            let cname = String::from_utf8_lossy(er.u16_prefixed()?).into_owned();
            let offset = er.u64()?;
            let len = er.u32()?;
            bmh.record_column(&cname, offset, len);
        }
        out.push((
            BlockSummary {
                high_ts,
                low_ts,
                rec_count,
            },
            bmh,
        ));
    }
    Ok(out)
}
