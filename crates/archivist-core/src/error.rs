//! Error Types for Archivist Core
//!
//! ## Error Categories
//!
//! ### Index Errors
//! - `InvalidIndex`: An index document is malformed or breaks the contiguity
//!   invariants between its chunk descriptors
//!
//! ### Naming Errors
//! - `InvalidKey`: An object key does not follow the archive naming scheme
//! - `InvalidTimestamp`: A record timestamp cannot be mapped to a calendar date
//!
//! ### Codec Errors
//! - `Compression`: Failed to gzip a chunk payload
//! - `Decompression`: A payload slice is not a valid gzip member
//!
//! ## Usage
//! All functions in this crate return `Result<T>`, aliased to
//! `Result<T, Error>`, so callers can propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Invalid record timestamp: {0}")]
    InvalidTimestamp(u64),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = Error::InvalidIndex("chunks out of order".to_string());
        assert_eq!(err.to_string(), "Invalid index: chunks out of order");

        let err = Error::InvalidTimestamp(u64::MAX);
        assert!(err.to_string().contains(&u64::MAX.to_string()));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_io_error_has_source() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
