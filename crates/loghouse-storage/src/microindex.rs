//! Column File Naming and Micro-Index Records
//!
//! Every column of a segment owns two append-only files next to the segment
//! key: `<segkey>_<hash>.csg` with its data blocks and `<segkey>_<hash>.cmi`
//! with its micro-indices, where `<hash>` is the xxh64 of the column name.
//!
//! ## `.cmi` Records
//!
//! Bloom and range records share the file; the type byte tells them apart.
//!
//! ```text
//! bloom: [size u32][blockNum u16][0x01][serialized bloom]    size = bloom bytes + 3
//! range: [len u32][blockNum u16][0x02]{[keyLen u16][key][numType][min][max]}*
//! ```
//!
//! Both length fields count every byte after themselves.

use std::path::{Path, PathBuf};

use bytes::BufMut;
use loghouse_core::bytes_ext::LeReader;
use loghouse_core::CmiType;
use xxhash_rust::xxh64::xxh64;

use crate::bloom::BloomIndex;
use crate::error::{Error, Result};
use crate::fileutils::append_block;
use crate::range::RangeIndex;

/// `<segkey>_<xxh64(cname)>`
pub fn column_file_stem(segkey: &str, cname: &str) -> String {
    format!("{}_{}", segkey, xxh64(cname.as_bytes(), 0))
}

pub fn csg_path(segkey: &str, cname: &str) -> PathBuf {
    PathBuf::from(format!("{}.csg", column_file_stem(segkey, cname)))
}

pub fn cmi_path(segkey: &str, cname: &str) -> PathBuf {
    PathBuf::from(format!("{}.cmi", column_file_stem(segkey, cname)))
}

/// Append the bloom record of block `blk_num` to `out`.
pub fn encode_bloom_record(blk_num: u16, bloom: &BloomIndex, out: &mut Vec<u8>) -> usize {
    let bytes = bloom.to_bytes();
    let start = out.len();
    out.put_u32_le((bytes.len() + 3) as u32);
    out.put_u16_le(blk_num);
    out.put_u8(CmiType::Bloom.as_byte());
    out.put_slice(&bytes);
    out.len() - start
}

/// Append the bloom record of block `blk_num` to the column's `.cmi` file.
pub fn flush_bloom(path: &Path, blk_num: u16, bloom: &BloomIndex) -> Result<usize> {
    let mut buf = Vec::new();
    let written = encode_bloom_record(blk_num, bloom, &mut buf);
    append_block(path, &buf)?;
    Ok(written)
}

/// Append the range record of block `blk_num` to the column's `.cmi` file.
pub fn flush_range(path: &Path, blk_num: u16, range: &RangeIndex) -> Result<usize> {
    let mut buf = Vec::new();
    let written = range.encode_block(blk_num, &mut buf)?;
    append_block(path, &buf)?;
    Ok(written)
}

/// One record read back from a `.cmi` file.
#[derive(Debug)]
pub enum CmiRecord {
    Bloom { blk_num: u16, bloom: BloomIndex },
    /// Raw range entries, starting at the first key length.
    Range { blk_num: u16, entries: Vec<u8> },
}

impl CmiRecord {
    pub fn blk_num(&self) -> u16 {
        match self {
            CmiRecord::Bloom { blk_num, .. } | CmiRecord::Range { blk_num, .. } => *blk_num,
        }
    }
}

/// Read every record of a `.cmi` file in write order.
pub fn read_cmi(path: &Path) -> Result<Vec<CmiRecord>> {
    let data = std::fs::read(path)?;
    let mut r = LeReader::new(&data);
    let mut records = Vec::new();

    while !r.is_empty() {
        let len = r.u32()? as usize;
        let body = r.take(len)?;
        let mut br = LeReader::new(body);
        let blk_num = br.u16()?;
        let cmi_type = br.u8()?;
        let rest = br.take(br.remaining())?;
        let record = if cmi_type == CmiType::Bloom.as_byte() {
            CmiRecord::Bloom {
                blk_num,
                bloom: BloomIndex::from_bytes(rest)?,
            }
        } else if cmi_type == CmiType::Range.as_byte() {
            CmiRecord::Range {
                blk_num,
                entries: rest.to_vec(),
            }
        } else {
            return Err(Error::Core(loghouse_core::Error::UnknownEncodingType(
                cmi_type,
            )));
        };
        records.push(record);
    }

    Ok(records)
}
