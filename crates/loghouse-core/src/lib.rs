//! Shared value codec for the loghouse write path.
//!
//! Column buffers, dictionaries, star-tree dictionaries and segment files all
//! speak the same one-byte-tag value encoding defined here.

pub mod bytes_ext;
pub mod dtype;
pub mod error;
pub mod pool;
pub mod value;

pub use dtype::{CmiType, EncodingType, SegDtype, ValueTag, RR_ENC_BITSET};
pub use error::{Error, Result};
pub use pool::BufferPool;
pub use value::{
    decode_value, encode_backfill, encode_bool, encode_dict_array, encode_number,
    encode_number_wide, encode_raw_json, encode_str, tlv_len, tlv_slice, CValue,
    DictArrayEntry, DictValueType, Number,
};
