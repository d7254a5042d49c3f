//! Error Types for the Value Codec
//!
//! This module defines the errors raised while encoding or decoding column
//! values in their tag-length-value (TLV) wire form.
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - `Io`: file system operations performed by callers of the codec
//!
//! ### Malformed Input
//! - `UnknownEncodingType`: the type byte at the decode position is not a known tag
//! - `Truncated`: the buffer ended before the value it announces
//! - `InvalidDictArray`: a tag array entry is missing `key`/`type`/`value` or
//!   names a type the dict-array encoding cannot carry
//! - `Json`: a raw JSON fragment could not be parsed
//!
//! ### Boundary Errors
//! - `StringTooLong`: strings carry a 16-bit length, so anything above
//!   65,535 bytes must be truncated or rejected by the caller
//!
//! ## Usage
//! Every codec function returns `Result<T>`, aliased to `Result<T, Error>`,
//! so callers propagate with `?`.
//!
//! ## Example
//! ```ignore
//! use loghouse_core::{decode_value, Error, Result};
//!
//! fn first_value(col: &[u8]) -> Result<usize> {
//!     let (_value, _dtype, consumed) = decode_value(col)?;
//!     Ok(consumed)
//! }
//!
//! assert!(matches!(first_value(&[0xEE]), Err(Error::UnknownEncodingType(0xEE))));
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown encoding type: {0:#04x}")]
    UnknownEncodingType(u8),

    #[error("Truncated value: needed {needed} bytes at offset {offset}, buffer has {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("String too long for a 16-bit length field: {0} bytes")]
    StringTooLong(usize),

    #[error("Invalid dict array entry: {0}")]
    InvalidDictArray(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
