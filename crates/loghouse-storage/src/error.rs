//! Storage Error Types
//!
//! This module defines all error types that can occur on the write path.
//!
//! ## Error Categories
//!
//! ### Malformed Input
//! - `Core`: value encoding/decoding failed (unknown tag, truncated value, oversized string)
//! - `MalformedRecord`: the record is not a JSON object or holds an unsupported value
//! - `UnknownSignalType`: a signal type the column encoder does not accept
//! - `InvalidConfig`: configuration values that contradict each other
//!
//! ### Resource Exhaustion (retryable)
//! - `TooManySegStores`: the registry is at its open-store ceiling
//! - `FdQuotaExhausted`: the descriptor limiter stayed full through every retry
//!
//! ### Flush and Rotation
//! - `Io`: file system operation failed
//! - `NoSegStats`: a stats flush was requested before any column produced stats
//! - `Rotation`: the active segment could not be moved to its final location
//! - `StarTree`: the aggregation tree could not be built or encoded
//! - `Compression`: a column payload failed to compress or decompress
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. Callers that retry check [`Error::is_retryable`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Value codec error: {0}")]
    Core(#[from] loghouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown signal type")]
    UnknownSignalType,

    #[error("Too many segment stores open ({0}), retry later")]
    TooManySegStores(usize),

    #[error("File descriptor quota exhausted: requested {requested} after {retries} retries")]
    FdQuotaExhausted { requested: usize, retries: u32 },

    #[error("No segment statistics to flush")]
    NoSegStats,

    #[error("Rotation failed: {0}")]
    Rotation(String),

    #[error("Star-tree error: {0}")]
    StarTree(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl Error {
    /// Resource-exhaustion errors the caller should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TooManySegStores(_) | Error::FdQuotaExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TooManySegStores(10).is_retryable());
        assert!(Error::FdQuotaExhausted {
            requested: 4,
            retries: 10
        }
        .is_retryable());
        assert!(!Error::NoSegStats.is_retryable());
        assert!(!Error::Core(loghouse_core::Error::UnknownEncodingType(0x7f)).is_retryable());
    }
}
