//! Archivist Core
//!
//! Shared data model for the Archivist partition archiver: the records that
//! flow in from the upstream transport, the chunk and index descriptors that
//! describe archived data, the deterministic object naming scheme and the
//! gzip codec used for chunk payloads.
//!
//! Nothing in this crate performs I/O against an object store. The pipeline
//! that buffers, seals and publishes chunks lives in `archivist-sink`.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod keys;
pub mod record;

pub use chunk::{Chunk, IndexFile};
pub use error::{Error, Result};
pub use keys::ObjectKeys;
pub use record::{SinkRecord, TopicPartition};
