//! Column Value Encoding
//!
//! This module turns single typed values into the tag-length-value (TLV) form
//! stored in column buffers, and reads them back.
//!
//! ## Wire Form
//!
//! Each value is `[tag 1B][payload]` where the tag (see [`ValueTag`]) fixes
//! the payload width or announces a 16-bit length prefix:
//!
//! ```text
//! small string : [0x02][len u16][utf8 bytes]
//! bool         : [0x01][0|1]
//! numbers      : [tag][1|2|4|8 bytes]        narrowest width that fits
//! backfill     : [0x13]                      no payload
//! raw json     : [0x15][len u16][json bytes]
//! dict array   : [0x14][len u16]{[keyLen u16][key][valTag][valLen u16][val]}*
//! ```
//!
//! ## Number Narrowing
//!
//! Numbers are first normalised by [`Number::narrowest`]:
//! - a float with no fractional part becomes an integer
//! - a non-negative integer is treated as unsigned
//!
//! Unsigned values then pick the smallest of u8/u16/u32/u64 that holds them,
//! negative values the smallest of i8/i16/i32/i64, and everything else is
//! stored as float64. So `127` and `128` are both `UINT8`, `-129` is `INT16`
//! and `-0` is `UINT8`.
//!
//! ## Strings
//!
//! The small-string length field is 16 bits. Encoding a longer string fails
//! with [`Error::StringTooLong`]; callers decide whether to truncate or drop.

use bytes::BufMut;

use crate::bytes_ext::{put_u16_prefixed, LeReader};
use crate::dtype::{SegDtype, ValueTag};
use crate::error::{Error, Result};

/// Largest string the small-string encoding can carry.
pub const MAX_SMALL_STRING_LEN: usize = u16::MAX as usize;

/// A numeric value before width selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl Number {
    /// Convert a parsed JSON number, keeping integers exact.
    pub fn from_json(n: &serde_json::Number) -> Option<Self> {
        if let Some(u) = n.as_u64() {
            Some(Self::Unsigned(u))
        } else if let Some(i) = n.as_i64() {
            Some(Self::Signed(i))
        } else {
            n.as_f64().map(Self::Float)
        }
    }

    /// Parse a decimal string, trying an integer first and a float second.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(i) = s.parse::<i64>() {
            return Some(Self::Signed(i));
        }
        if let Ok(u) = s.parse::<u64>() {
            return Some(Self::Unsigned(u));
        }
        match s.parse::<f64>() {
            Ok(f) if f.is_finite() => Some(Self::Float(f)),
            _ => None,
        }
    }

    /// Normalise to the representation whose width will be chosen.
    pub fn narrowest(self) -> Self {
        match self {
            Self::Signed(i) if i >= 0 => Self::Unsigned(i as u64),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                if f >= 0.0 && f < u64::MAX as f64 {
                    Self::Unsigned(f as u64)
                } else if f < 0.0 && f >= i64::MIN as f64 {
                    Self::Signed(f as i64)
                } else {
                    self
                }
            }
            other => other,
        }
    }

    /// Tag used for this value once narrowed.
    pub fn narrowest_tag(self) -> ValueTag {
        match self.narrowest() {
            Self::Unsigned(u) => {
                if u <= u8::MAX as u64 {
                    ValueTag::Uint8
                } else if u <= u16::MAX as u64 {
                    ValueTag::Uint16
                } else if u <= u32::MAX as u64 {
                    ValueTag::Uint32
                } else {
                    ValueTag::Uint64
                }
            }
            Self::Signed(i) => {
                if i >= i8::MIN as i64 {
                    ValueTag::Int8
                } else if i >= i16::MIN as i64 {
                    ValueTag::Int16
                } else if i >= i32::MIN as i64 {
                    ValueTag::Int32
                } else {
                    ValueTag::Int64
                }
            }
            Self::Float(_) => ValueTag::Float64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Unsigned(u) => u as f64,
            Self::Signed(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float(_))
    }
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsigned(u) => write!(f, "{}", u),
            Self::Signed(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Value type carried by one entry of a dict array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictValueType {
    String,
    Bool,
    Int64,
    Float64,
}

impl DictValueType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "int64" => Some(Self::Int64),
            "float64" => Some(Self::Float64),
            _ => None,
        }
    }

    fn tag(self) -> ValueTag {
        match self {
            Self::String => ValueTag::SmallString,
            Self::Bool => ValueTag::Bool,
            Self::Int64 => ValueTag::Int64,
            Self::Float64 => ValueTag::Float64,
        }
    }

    fn from_tag(b: u8) -> Result<Self> {
        match ValueTag::from_byte(b) {
            Some(ValueTag::SmallString) => Ok(Self::String),
            Some(ValueTag::Bool) => Ok(Self::Bool),
            Some(ValueTag::Int64) => Ok(Self::Int64),
            Some(ValueTag::Float64) => Ok(Self::Float64),
            _ => Err(Error::UnknownEncodingType(b)),
        }
    }
}

/// One `{key, type, value}` element of a tag array (trace span tags, process tags).
///
/// The value is kept in its textual form; the type only records how the
/// producer declared it.
#[derive(Debug, Clone, PartialEq)]
pub struct DictArrayEntry {
    pub key: String,
    pub vtype: DictValueType,
    pub value: String,
}

impl DictArrayEntry {
    /// Build an entry from a JSON object `{"key": .., "type": .., "value": ..}`.
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::InvalidDictArray(format!("expected object, got {}", v)))?;

        let mut key = None;
        let mut vtype = None;
        let mut value = None;
        for (k, field) in obj {
            match k.as_str() {
                "key" => match field {
                    serde_json::Value::String(s) => key = Some(s.clone()),
                    other => {
                        return Err(Error::InvalidDictArray(format!(
                            "key must be a string, got {}",
                            other
                        )))
                    }
                },
                "type" => vtype = Some(json_text(field)),
                "value" => value = Some(json_text(field)),
                other => {
                    return Err(Error::InvalidDictArray(format!("unknown field {}", other)));
                }
            }
        }

        let (key, vtype, value) = match (key, vtype, value) {
            (Some(k), Some(t), Some(v)) if !k.is_empty() && !t.is_empty() && !v.is_empty() => {
                (k, t, v)
            }
            _ => {
                return Err(Error::InvalidDictArray(
                    "tag entries need non-empty key, type and value".to_string(),
                ))
            }
        };
        let vtype = DictValueType::from_name(&vtype)
            .ok_or_else(|| Error::InvalidDictArray(format!("unknown value type {}", vtype)))?;

        Ok(Self { key, vtype, value })
    }

    fn encoded_len(&self) -> usize {
        2 + self.key.len() + 1 + 2 + self.value.len()
    }
}

fn json_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum CValue {
    Backfill,
    Bool(bool),
    Str(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    DictArray(Vec<DictArrayEntry>),
    RawJson(Vec<u8>),
}

impl CValue {
    /// Numeric view of the value, `None` for non-numbers.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Unsigned(u) => Some(Number::Unsigned(*u)),
            Self::Signed(i) => Some(Number::Signed(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }
}

/// Append a small string. Returns the number of bytes written.
pub fn encode_str<B: BufMut>(buf: &mut B, s: &[u8]) -> Result<usize> {
    if s.len() > MAX_SMALL_STRING_LEN {
        return Err(Error::StringTooLong(s.len()));
    }
    buf.put_u8(ValueTag::SmallString.as_byte());
    Ok(1 + put_u16_prefixed(buf, s)?)
}

pub fn encode_bool<B: BufMut>(buf: &mut B, v: bool) -> usize {
    buf.put_u8(ValueTag::Bool.as_byte());
    buf.put_u8(v as u8);
    2
}

pub fn encode_backfill<B: BufMut>(buf: &mut B) -> usize {
    buf.put_u8(ValueTag::Backfill.as_byte());
    1
}

/// Append a number using the narrowest width that represents it exactly.
pub fn encode_number<B: BufMut>(buf: &mut B, n: Number) -> usize {
    let n = n.narrowest();
    let tag = n.narrowest_tag();
    buf.put_u8(tag.as_byte());
    match (tag, n) {
        (ValueTag::Uint8, Number::Unsigned(u)) => buf.put_u8(u as u8),
        (ValueTag::Uint16, Number::Unsigned(u)) => buf.put_u16_le(u as u16),
        (ValueTag::Uint32, Number::Unsigned(u)) => buf.put_u32_le(u as u32),
        (ValueTag::Uint64, Number::Unsigned(u)) => buf.put_u64_le(u),
        (ValueTag::Int8, Number::Signed(i)) => buf.put_i8(i as i8),
        (ValueTag::Int16, Number::Signed(i)) => buf.put_i16_le(i as i16),
        (ValueTag::Int32, Number::Signed(i)) => buf.put_i32_le(i as i32),
        (ValueTag::Int64, Number::Signed(i)) => buf.put_i64_le(i),
        (_, other) => buf.put_f64_le(other.as_f64()),
    }
    1 + tag.fixed_payload_len().unwrap_or(8)
}

/// Append a number at full width (`INT64`, `UINT64` or `FLOAT64`).
pub fn encode_number_wide<B: BufMut>(buf: &mut B, n: Number) -> usize {
    match n {
        Number::Unsigned(u) => {
            buf.put_u8(ValueTag::Uint64.as_byte());
            buf.put_u64_le(u);
        }
        Number::Signed(i) => {
            buf.put_u8(ValueTag::Int64.as_byte());
            buf.put_i64_le(i);
        }
        Number::Float(f) => {
            buf.put_u8(ValueTag::Float64.as_byte());
            buf.put_f64_le(f);
        }
    }
    9
}

pub fn encode_raw_json<B: BufMut>(buf: &mut B, raw: &[u8]) -> Result<usize> {
    if raw.len() > MAX_SMALL_STRING_LEN {
        return Err(Error::StringTooLong(raw.len()));
    }
    buf.put_u8(ValueTag::RawJson.as_byte());
    Ok(1 + put_u16_prefixed(buf, raw)?)
}

/// Append a dict array. The total length is computed up front so the
/// header never needs patching.
pub fn encode_dict_array<B: BufMut>(buf: &mut B, entries: &[DictArrayEntry]) -> Result<usize> {
    let body: usize = entries.iter().map(DictArrayEntry::encoded_len).sum();
    let body_len = u16::try_from(body).map_err(|_| Error::StringTooLong(body))?;

    buf.put_u8(ValueTag::DictArray.as_byte());
    buf.put_u16_le(body_len);
    for e in entries {
        put_u16_prefixed(buf, e.key.as_bytes())?;
        buf.put_u8(e.vtype.tag().as_byte());
        put_u16_prefixed(buf, e.value.as_bytes())?;
    }
    Ok(3 + body)
}

/// Total encoded length (tag included) of the value starting at `rec[0]`.
pub fn tlv_len(rec: &[u8]) -> Result<usize> {
    let first = *rec.first().ok_or(Error::Truncated {
        offset: 0,
        needed: 1,
        available: 0,
    })?;
    let tag = ValueTag::from_byte(first).ok_or(Error::UnknownEncodingType(first))?;

    let len = match tag.fixed_payload_len() {
        Some(n) => 1 + n,
        None => {
            let mut r = LeReader::new(&rec[1..]);
            match tag {
                ValueTag::LargeString => 5 + r.u32()? as usize,
                _ => 3 + r.u16()? as usize,
            }
        }
    };
    if rec.len() < len {
        return Err(Error::Truncated {
            offset: 0,
            needed: len,
            available: rec.len(),
        });
    }
    Ok(len)
}

/// Slice out exactly one encoded value from the front of `rec`.
pub fn tlv_slice(rec: &[u8]) -> Result<&[u8]> {
    let len = tlv_len(rec)?;
    Ok(&rec[..len])
}

/// Decode the value at the front of `buf`.
///
/// ## Returns
///
/// `(value, dtype, consumed)` where `consumed` counts the tag byte.
///
/// ## Errors
///
/// [`Error::UnknownEncodingType`] for a tag outside the wire set and
/// [`Error::Truncated`] when the buffer ends inside the value.
pub fn decode_value(buf: &[u8]) -> Result<(CValue, SegDtype, usize)> {
    let mut r = LeReader::new(buf);
    let first = r.u8()?;
    let tag = ValueTag::from_byte(first).ok_or(Error::UnknownEncodingType(first))?;

    let value = match tag {
        ValueTag::Backfill => CValue::Backfill,
        ValueTag::Bool => CValue::Bool(r.u8()? != 0),
        ValueTag::SmallString => {
            CValue::Str(String::from_utf8_lossy(r.u16_prefixed()?).into_owned())
        }
        ValueTag::LargeString => {
            let len = r.u32()? as usize;
            CValue::Str(String::from_utf8_lossy(r.take(len)?).into_owned())
        }
        ValueTag::Uint8 => CValue::Unsigned(r.u8()? as u64),
        ValueTag::Uint16 => CValue::Unsigned(r.u16()? as u64),
        ValueTag::Uint32 => CValue::Unsigned(r.u32()? as u64),
        ValueTag::Uint64 => CValue::Unsigned(r.u64()?),
        ValueTag::Int8 => CValue::Signed(r.u8()? as i8 as i64),
        ValueTag::Int16 => CValue::Signed(r.u16()? as i16 as i64),
        ValueTag::Int32 => CValue::Signed(r.u32()? as i32 as i64),
        ValueTag::Int64 => CValue::Signed(r.i64()?),
        ValueTag::Float64 => CValue::Float(r.f64()?),
        ValueTag::RawJson => CValue::RawJson(r.u16_prefixed()?.to_vec()),
        ValueTag::DictArray => CValue::DictArray(decode_dict_entries(r.u16_prefixed()?)?),
    };
    Ok((value, tag.dtype(), r.position()))
}

fn decode_dict_entries(body: &[u8]) -> Result<Vec<DictArrayEntry>> {
    let mut r = LeReader::new(body);
    let mut entries = Vec::new();
    while !r.is_empty() {
        let key = String::from_utf8_lossy(r.u16_prefixed()?).into_owned();
        let vtype = DictValueType::from_tag(r.u8()?)?;
        let value = String::from_utf8_lossy(r.u16_prefixed()?).into_owned();
        entries.push(DictArrayEntry { key, vtype, value });
    }
    Ok(entries)
}
