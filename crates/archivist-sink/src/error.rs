//! Error types for the archive pipeline.
//!
//! Every error that reaches a caller of the pipeline is fatal for the
//! partition it concerns: transient object-store failures are retried inside
//! the uploader and only surface once retries are exhausted, and upstream
//! commit failures are retried without bound and never surface at all.

use thiserror::Error;

/// Errors that can occur while archiving a partition.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An incoming offset does not continue the archived sequence.
    #[error("Ordering violation on {topic}-{partition}: expected offset {expected}, got {actual}")]
    OrderingViolation {
        topic: String,
        partition: u32,
        expected: u64,
        actual: u64,
    },

    /// A record could not be rendered as an archive line.
    #[error("Render error at offset {offset}: {reason}")]
    RenderError { offset: u64, reason: String },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Failure in the shared data model (index, naming, codec).
    #[error("Core error: {0}")]
    CoreError(#[from] archivist_core::Error),

    /// Low-level object store failure that is not retried.
    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    /// An object write kept failing until retries ran out.
    #[error("Publish of '{key}' failed after {attempts} attempts: {reason}")]
    PublishFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// An object read kept failing until retries ran out.
    #[error("Read of '{key}' failed after {attempts} attempts: {reason}")]
    ReadFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// The pointer was changed by someone else since it was last read.
    #[error("Concurrent writer detected on pointer '{pointer_key}'")]
    ConcurrentWriter { pointer_key: String },

    /// The pointer names an index that is missing or violates its invariants.
    #[error("Corrupt index '{key}': {reason}")]
    CorruptIndex { key: String, reason: String },

    /// The partition already failed and accepts no further work.
    #[error("Partition {topic}-{partition} has failed")]
    PartitionFailed { topic: String, partition: u32 },

    /// Records arrived for a partition this sink does not own.
    #[error("Partition {topic}-{partition} is not assigned")]
    NotAssigned { topic: String, partition: u32 },

    /// Failed to reach the object store or build its client.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error in the archiver runtime.
    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl From<serde_json::Error> for ArchiveError {
    fn from(e: serde_json::Error) -> Self {
        ArchiveError::SerializationError(e.to_string())
    }
}
