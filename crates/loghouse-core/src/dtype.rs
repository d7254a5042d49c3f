//! Type Tags and Data Types
//!
//! Every value written into a column buffer starts with a one-byte type tag.
//! The tag alone determines how many payload bytes follow, which is what lets
//! readers walk a column without any side index.
//!
//! ## Value Tags
//!
//! | Tag    | Kind          | Payload                         |
//! |--------|---------------|---------------------------------|
//! | `0x01` | bool          | 1 byte                          |
//! | `0x02` | small string  | `[len u16][bytes]`              |
//! | `0x03` | uint8         | 1 byte                          |
//! | `0x04` | uint16        | 2 bytes                         |
//! | `0x05` | uint32        | 4 bytes                         |
//! | `0x06` | uint64        | 8 bytes                         |
//! | `0x07` | int8          | 1 byte                          |
//! | `0x08` | int16         | 2 bytes                         |
//! | `0x09` | int32         | 4 bytes                         |
//! | `0x10` | int64         | 8 bytes                         |
//! | `0x11` | float64       | 8 bytes                         |
//! | `0x12` | large string  | `[len u32][bytes]`              |
//! | `0x13` | backfill      | none                            |
//! | `0x14` | dict array    | `[len u16][entries]`            |
//! | `0x15` | raw JSON      | `[len u16][bytes]`              |
//!
//! All multi-byte integers are little-endian.

/// One-byte tag that prefixes every encoded column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Bool = 0x01,
    SmallString = 0x02,
    Uint8 = 0x03,
    Uint16 = 0x04,
    Uint32 = 0x05,
    Uint64 = 0x06,
    Int8 = 0x07,
    Int16 = 0x08,
    Int32 = 0x09,
    Int64 = 0x10,
    Float64 = 0x11,
    LargeString = 0x12,
    Backfill = 0x13,
    DictArray = 0x14,
    RawJson = 0x15,
}

impl ValueTag {
    /// Map a raw byte back to its tag, `None` for anything outside the wire set.
    pub fn from_byte(b: u8) -> Option<Self> {
        let tag = match b {
            0x01 => Self::Bool,
            0x02 => Self::SmallString,
            0x03 => Self::Uint8,
            0x04 => Self::Uint16,
            0x05 => Self::Uint32,
            0x06 => Self::Uint64,
            0x07 => Self::Int8,
            0x08 => Self::Int16,
            0x09 => Self::Int32,
            0x10 => Self::Int64,
            0x11 => Self::Float64,
            0x12 => Self::LargeString,
            0x13 => Self::Backfill,
            0x14 => Self::DictArray,
            0x15 => Self::RawJson,
            _ => return None,
        };
        Some(tag)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Payload width for fixed-size tags, `None` for length-prefixed ones.
    pub fn fixed_payload_len(self) -> Option<usize> {
        match self {
            Self::Backfill => Some(0),
            Self::Bool | Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::SmallString | Self::LargeString | Self::DictArray | Self::RawJson => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Uint16
                | Self::Uint32
                | Self::Uint64
                | Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::Float64
        )
    }

    /// The logical data type a decoded value of this tag carries.
    pub fn dtype(self) -> SegDtype {
        match self {
            Self::Bool => SegDtype::Bool,
            Self::SmallString | Self::LargeString => SegDtype::String,
            Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64 => SegDtype::UnsignedNum,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => SegDtype::SignedNum,
            Self::Float64 => SegDtype::Float,
            Self::Backfill => SegDtype::Backfill,
            Self::DictArray => SegDtype::ArrayDict,
            Self::RawJson => SegDtype::RawJson,
        }
    }
}

/// Logical data type codes shared with the query side.
///
/// The numeric values are persisted (aggregate values in star-tree levels,
/// numeric types in segment statistics), so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SegDtype {
    #[default]
    Invalid = 0,
    Bool = 1,
    SignedNum = 2,
    UnsignedNum = 3,
    Float = 4,
    String = 5,
    StringSet = 6,
    Backfill = 7,
    ArrayDict = 14,
    RawJson = 15,
}

impl SegDtype {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        let dtype = match b {
            0 => Self::Invalid,
            1 => Self::Bool,
            2 => Self::SignedNum,
            3 => Self::UnsignedNum,
            4 => Self::Float,
            5 => Self::String,
            6 => Self::StringSet,
            7 => Self::Backfill,
            14 => Self::ArrayDict,
            15 => Self::RawJson,
            _ => return None,
        };
        Some(dtype)
    }
}

/// Block encoding written as the first byte of every column block in a `.csg` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncodingType {
    /// LZ4-compressed concatenation of per-record TLVs.
    Columnar = 0,
    /// LZ4-compressed packed dictionary.
    Dictionary = 1,
    /// `[tsType][lowTs][deltas]`, stored uncompressed.
    TimestampTopDiffVarEnc = 2,
    /// First byte of a star-tree metadata file.
    StarTreeBlock = 3,
}

impl EncodingType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Columnar),
            1 => Some(Self::Dictionary),
            2 => Some(Self::TimestampTopDiffVarEnc),
            3 => Some(Self::StarTreeBlock),
            _ => None,
        }
    }
}

/// Record type of an entry in a column micro-index (`.cmi`) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmiType {
    Bloom = 0x01,
    Range = 0x02,
}

impl CmiType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Encoding of a rolled-up record set inside a `.crup` file.
pub const RR_ENC_BITSET: u8 = 0x01;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_covers_wire_set() {
        for b in 0u8..=0xFF {
            if let Some(tag) = ValueTag::from_byte(b) {
                assert_eq!(tag.as_byte(), b);
            }
        }
        assert!(ValueTag::from_byte(0x00).is_none());
        assert!(ValueTag::from_byte(0x0A).is_none());
        assert!(ValueTag::from_byte(0x16).is_none());
    }

    #[test]
    fn test_backfill_has_no_payload() {
        assert_eq!(ValueTag::Backfill.fixed_payload_len(), Some(0));
        assert_eq!(ValueTag::Backfill.dtype(), SegDtype::Backfill);
    }

    #[test]
    fn test_dtype_codes_are_stable() {
        assert_eq!(SegDtype::SignedNum.as_byte(), 2);
        assert_eq!(SegDtype::Float.as_byte(), 4);
        assert_eq!(SegDtype::Backfill.as_byte(), 7);
        assert_eq!(SegDtype::ArrayDict.as_byte(), 14);
        assert_eq!(SegDtype::from_byte(15), Some(SegDtype::RawJson));
        assert_eq!(SegDtype::from_byte(9), None);
    }
}
