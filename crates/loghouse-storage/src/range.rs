//! Block Range Index
//!
//! Numeric columns record their per-block minimum and maximum so the query
//! side can skip blocks whose range cannot satisfy a comparison.
//!
//! ## Type Promotion
//!
//! A range starts in the type of its first value and only ever widens:
//!
//! | current  | incoming unsigned | incoming signed | incoming float |
//! |----------|-------------------|-----------------|----------------|
//! | Unsigned | Unsigned          | Signed          | Float          |
//! | Signed   | Signed            | Signed          | Float          |
//! | Float    | Float             | Float           | Float          |
//!
//! On promotion the stored extremes are reinterpreted in the new type before
//! the incoming value is compared.
//!
//! ## Record Layout
//!
//! One `.cmi` range record per column per block:
//!
//! ```text
//! [recordLen u32][blockNum u16][cmiType=0x02]
//!     {[keyLen u16][key][numType 0|1|2][min 8B][max 8B]}*
//! ```
//!
//! `recordLen` counts every byte after itself.

use std::collections::BTreeMap;

use bytes::BufMut;
use loghouse_core::bytes_ext::{patch_u32, put_u16_prefixed};
use loghouse_core::{CmiType, Number};

use crate::error::Result;

/// Min/max of one key, in the widest type seen so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumRange {
    Unsigned { min: u64, max: u64 },
    Signed { min: i64, max: i64 },
    Float { min: f64, max: f64 },
}

impl NumRange {
    fn of(n: Number) -> Self {
        match n {
            Number::Unsigned(u) => Self::Unsigned { min: u, max: u },
            Number::Signed(i) => Self::Signed { min: i, max: i },
            Number::Float(f) => Self::Float { min: f, max: f },
        }
    }

    /// Fold `n` into the range, promoting the type first when needed.
    pub fn update(&mut self, n: Number) {
        *self = match (*self, n) {
            (Self::Unsigned { min, max }, Number::Unsigned(v)) => Self::Unsigned {
                min: min.min(v),
                max: max.max(v),
            },
            (Self::Unsigned { min, max }, Number::Signed(v)) => Self::Signed {
                min: (min as i64).min(v),
                max: (max as i64).max(v),
            },
            (Self::Signed { min, max }, Number::Unsigned(v)) => Self::Signed {
                min: min.min(v as i64),
                max: max.max(v as i64),
            },
            (Self::Signed { min, max }, Number::Signed(v)) => Self::Signed {
                min: min.min(v),
                max: max.max(v),
            },
            (Self::Float { min, max }, v) => {
                let v = v.as_f64();
                Self::Float {
                    min: min.min(v),
                    max: max.max(v),
                }
            }
            (current, Number::Float(v)) => {
                let (min, max) = current.as_f64_bounds();
                Self::Float {
                    min: min.min(v),
                    max: max.max(v),
                }
            }
        };
    }

    pub fn as_f64_bounds(&self) -> (f64, f64) {
        match *self {
            Self::Unsigned { min, max } => (min as f64, max as f64),
            Self::Signed { min, max } => (min as f64, max as f64),
            Self::Float { min, max } => (min, max),
        }
    }

    /// Persisted numeric type code.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Unsigned { .. } => 0,
            Self::Signed { .. } => 1,
            Self::Float { .. } => 2,
        }
    }

    fn put_bounds<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Self::Unsigned { min, max } => {
                buf.put_u64_le(min);
                buf.put_u64_le(max);
            }
            Self::Signed { min, max } => {
                buf.put_i64_le(min);
                buf.put_i64_le(max);
            }
            Self::Float { min, max } => {
                buf.put_f64_le(min);
                buf.put_f64_le(max);
            }
        }
    }
}

/// Range index of one column for one block.
///
/// Keys are usually just the column name; a BTreeMap keeps the encoded
/// record order stable.
#[derive(Debug, Clone, Default)]
pub struct RangeIndex {
    ranges: BTreeMap<String, NumRange>,
}

impl RangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a value into the range for `key`, creating it on first use.
    pub fn update_range_index(&mut self, key: &str, value: Number) {
        match self.ranges.get_mut(key) {
            Some(range) => range.update(value),
            None => {
                self.ranges.insert(key.to_string(), NumRange::of(value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&NumRange> {
        self.ranges.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Append the `.cmi` range record for block `blk_num`.
    ///
    /// ## Returns
    ///
    /// The number of bytes appended.
    pub fn encode_block(&self, blk_num: u16, buf: &mut Vec<u8>) -> Result<usize> {
        let start = buf.len();
        buf.put_u32_le(0);
        buf.put_u16_le(blk_num);
        buf.put_u8(CmiType::Range.as_byte());
        for (key, range) in &self.ranges {
            put_u16_prefixed(buf, key.as_bytes())?;
            buf.put_u8(range.type_code());
            range.put_bounds(buf);
        }
        let written = buf.len() - start;
        patch_u32(buf, start, (written - 4) as u32);
        Ok(written)
    }
}
