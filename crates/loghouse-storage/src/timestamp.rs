//! Timestamp Column and Time Rollups
//!
//! The timestamp column is never TLV-encoded. Each block keeps the raw
//! millisecond timestamps in record order and flushes them as deltas from the
//! block minimum, at the narrowest width that holds the block's span:
//!
//! ```text
//! [tsType u8][lowTs u64][delta]*     tsType 0=u8, 1=u16, 2=u32, 3=u64
//! ```
//!
//! ## Rollups
//!
//! Alongside the deltas, every record is bucketed by minute, hour and day
//! (`(ts / MS_IN_X) * MS_IN_X`) into [`RecordBitmap`]s, and each bucket map is
//! appended per block to its own `.crup` file:
//!
//! ```text
//! [blkNum u16][numBuckets u16] { [bucketTs u64][encType=0x01][size u16][bitset] }*
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use loghouse_core::bytes_ext::LeReader;
use loghouse_core::RR_ENC_BITSET;
use xxhash_rust::xxh64::xxh64;

use crate::config::{MS_IN_DAY, MS_IN_HOUR, MS_IN_MIN};
use crate::error::{Error, Result};
use crate::pqmr::RecordBitmap;

/// Width of each delta in an encoded timestamp block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TsType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
}

impl TsType {
    pub fn for_span(span: u64) -> Self {
        if span <= u8::MAX as u64 {
            Self::U8
        } else if span <= u16::MAX as u64 {
            Self::U16
        } else if span <= u32::MAX as u64 {
            Self::U32
        } else {
            Self::U64
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::U8),
            1 => Some(Self::U16),
            2 => Some(Self::U32),
            3 => Some(Self::U64),
            _ => None,
        }
    }
}

/// Encode block timestamps as deltas from `low_ts`, see the module docs.
pub fn encode_timestamps(block_ts: &[u64], low_ts: u64, high_ts: u64, out: &mut Vec<u8>) {
    let ts_type = TsType::for_span(high_ts.saturating_sub(low_ts));
    out.put_u8(ts_type as u8);
    out.put_u64_le(low_ts);
    for &ts in block_ts {
        let delta = ts.saturating_sub(low_ts);
        match ts_type {
            TsType::U8 => out.put_u8(delta as u8),
            TsType::U16 => out.put_u16_le(delta as u16),
            TsType::U32 => out.put_u32_le(delta as u32),
            TsType::U64 => out.put_u64_le(delta),
        }
    }
}

/// Decode a timestamp block holding `rec_count` records.
pub fn decode_timestamps(buf: &[u8], rec_count: u16) -> Result<Vec<u64>> {
    let mut r = LeReader::new(buf);
    let type_byte = r.u8()?;
    let ts_type = TsType::from_byte(type_byte)
        .ok_or(Error::Core(loghouse_core::Error::UnknownEncodingType(type_byte)))?;
    let low_ts = r.u64()?;
    let mut out = Vec::with_capacity(rec_count as usize);
    for _ in 0..rec_count {
        let delta = match ts_type {
            TsType::U8 => r.u8()? as u64,
            TsType::U16 => r.u16()? as u64,
            TsType::U32 => r.u32()? as u64,
            TsType::U64 => r.u64()?,
        };
        out.push(low_ts + delta);
    }
    Ok(out)
}

/// Records of one time bucket.
#[derive(Debug, Clone, Default)]
pub struct RolledRecs {
    pub matched: RecordBitmap,
    pub last_rec_num: u16,
}

/// Minute, hour and day buckets of the current block.
#[derive(Debug, Default)]
pub struct Rollups {
    pub minutes: BTreeMap<u64, RolledRecs>,
    pub hours: BTreeMap<u64, RolledRecs>,
    pub days: BTreeMap<u64, RolledRecs>,
}

fn add_rollup(map: &mut BTreeMap<u64, RolledRecs>, bucket: u64, rec_num: u16) {
    let rr = map.entry(bucket).or_default();
    rr.matched.add_matched_record(rec_num);
    rr.last_rec_num = rec_num;
}

impl Rollups {
    pub fn add(&mut self, ts_ms: u64, rec_num: u16) {
        add_rollup(&mut self.minutes, (ts_ms / MS_IN_MIN) * MS_IN_MIN, rec_num);
        add_rollup(&mut self.hours, (ts_ms / MS_IN_HOUR) * MS_IN_HOUR, rec_num);
        add_rollup(&mut self.days, (ts_ms / MS_IN_DAY) * MS_IN_DAY, rec_num);
    }

    pub fn clear(&mut self) {
        self.minutes.clear();
        self.hours.clear();
        self.days.clear();
    }

    /// Append this block's buckets to the three `.crup` files under
    /// `<segment dir>/rups/`.
    ///
    /// Every file is attempted; the last error, if any, is returned.
    pub fn write(&self, segkey: &str, ts_key: &str, blk_num: u16) -> Result<()> {
        let dir = rollup_dir(segkey);
        fs::create_dir_all(&dir)?;

        let mut result = Ok(());
        for (suffix, map) in [("m", &self.minutes), ("h", &self.hours), ("d", &self.days)] {
            let path = rollup_file(&dir, ts_key, suffix);
            if let Err(e) = write_single_rup(&path, blk_num, map) {
                tracing::error!(file = %path.display(), error = %e, "Failed to write rollup file");
                result = Err(e);
            }
        }
        result
    }
}

fn rollup_dir(segkey: &str) -> PathBuf {
    Path::new(segkey)
        .parent()
        .map(|p| p.join("rups"))
        .unwrap_or_else(|| PathBuf::from("rups"))
}

/// `<dir>/<xxh64(ts_key + suffix)>.crup`
pub fn rollup_file(dir: &Path, ts_key: &str, suffix: &str) -> PathBuf {
    let hash = xxh64(format!("{}{}", ts_key, suffix).as_bytes(), 0);
    dir.join(format!("{}.crup", hash))
}

/// Path of one rollup file of a segment, `suffix` being `m`, `h` or `d`.
pub fn segment_rollup_file(segkey: &str, ts_key: &str, suffix: &str) -> PathBuf {
    rollup_file(&rollup_dir(segkey), ts_key, suffix)
}

fn write_single_rup(path: &Path, blk_num: u16, map: &BTreeMap<u64, RolledRecs>) -> Result<()> {
    let mut buf = Vec::new();
    buf.put_u16_le(blk_num);
    buf.put_u16_le(map.len() as u16);
    for (bucket, rr) in map {
        let mut bits = rr.matched.clone();
        bits.shrink_to_records(rr.last_rec_num as usize + 1);
        let bytes = bits.as_bytes();
        buf.put_u64_le(*bucket);
        buf.put_u8(RR_ENC_BITSET);
        buf.put_u16_le(bytes.len() as u16);
        buf.put_slice(bytes);
    }
    let mut fd = OpenOptions::new().create(true).append(true).open(path)?;
    fd.write_all(&buf)?;
    Ok(())
}

/// Read a `.crup` file back into `blkNum -> bucketTs -> records`.
pub fn read_rollup_file(path: &Path) -> Result<BTreeMap<u16, BTreeMap<u64, RecordBitmap>>> {
    let data = fs::read(path)?;
    let mut r = LeReader::new(&data);
    let mut blocks = BTreeMap::new();
    while !r.is_empty() {
        let blk_num = r.u16()?;
        let num_buckets = r.u16()?;
        let mut buckets = BTreeMap::new();
        for _ in 0..num_buckets {
            let bucket = r.u64()?;
            let enc = r.u8()?;
            if enc != RR_ENC_BITSET {
                return Err(Error::Core(loghouse_core::Error::UnknownEncodingType(enc)));
            }
            buckets.insert(bucket, RecordBitmap::from_bytes(r.u16_prefixed()?));
        }
        blocks.insert(blk_num, buckets);
    }
    Ok(blocks)
}
