//! Column Segment Blocks
//!
//! A `.csg` file is the concatenation of one block per flush of its column:
//!
//! ```text
//! [encType u8][payload]
//! ```
//!
//! | encType | payload |
//! |---|---|
//! | 0 columnar | LZ4 (size-prepended) of the concatenated TLV values |
//! | 1 dictionary | LZ4 (size-prepended) of the packed dictionary |
//! | 2 timestamp | `[tsType][lowTs u64][deltas]`, stored as is |
//!
//! Block offsets and lengths are kept in the block summary, so blocks carry
//! no length prefix of their own.

use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use loghouse_core::EncodingType;

use crate::error::{Error, Result};

/// Build the on-disk form of one column block into `out`.
pub fn encode_column_block(enc: EncodingType, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    out.push(enc.as_byte());
    match enc {
        EncodingType::Columnar | EncodingType::Dictionary => {
            out.extend_from_slice(&lz4_flex::compress_prepend_size(payload));
        }
        EncodingType::TimestampTopDiffVarEnc => out.extend_from_slice(payload),
        EncodingType::StarTreeBlock => {
            return Err(Error::Compression(
                "star-tree blocks are not column blocks".to_string(),
            ))
        }
    }
    Ok(())
}

/// Split a block into its encoding and decompressed payload.
pub fn decode_column_block(block: &[u8]) -> Result<(EncodingType, Cow<'_, [u8]>)> {
    let (&first, payload) = block.split_first().ok_or(loghouse_core::Error::Truncated {
        offset: 0,
        needed: 1,
        available: 0,
    })?;
    let enc = EncodingType::from_byte(first).ok_or(loghouse_core::Error::UnknownEncodingType(first))?;
    match enc {
        EncodingType::Columnar | EncodingType::Dictionary => {
            let raw = lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| Error::Compression(e.to_string()))?;
            Ok((enc, Cow::Owned(raw)))
        }
        EncodingType::TimestampTopDiffVarEnc => Ok((enc, Cow::Borrowed(payload))),
        EncodingType::StarTreeBlock => Err(Error::Compression(
            "unexpected star-tree block in column file".to_string(),
        )),
    }
}

/// Read the block at `offset..offset + len` of a `.csg` file.
pub fn read_column_block(path: &Path, offset: u64, len: u32) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut block = vec![0u8; len as usize];
    file.read_exact(&mut block)?;
    Ok(block)
}
