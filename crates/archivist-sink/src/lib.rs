//! Archivist Sink
//!
//! Archives a partitioned, ordered record stream into an object store as
//! gzip chunk payloads, JSON index files and one pointer object per
//! partition. Ordering is preserved per partition and a restarted pipeline
//! resumes exactly after the last published record.
//!
//! ## Architecture
//!
//! - **Buffer**: `PartitionBuffer` accumulates contiguous records until a size,
//!   count or age threshold calls for a seal.
//! - **Sealer**: `ChunkSealer` renders and compresses a buffer into a chunk;
//!   `ChunkGroup` collects chunks that share one payload and index.
//! - **Uploader**: publishes payload, then index, then pointer.
//! - **Recovery**: `RecoveryManager` derives the resume offset from the pointer.
//! - **Commit**: `OffsetCommitCoordinator` moves the upstream offset forward once
//!   a group is durable.
//! - **Sink**: `ArchiveSink` runs one `PartitionPipeline` per partition and
//!   implements `SinkTask`.
//! - **Runtime**: `ArchiverRuntime` drives sinks from a `RecordSource` as
//!   background tasks.
//! - **Reader**: `ArchiveReader` resolves pointer → index → payload.

pub mod buffer;
pub mod commit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod reader;
pub mod recovery;
pub mod runtime;
pub mod sealer;
pub mod sink;
pub mod store;
pub mod traits;
pub mod uploader;

// Re-export key types at crate root for convenience.
pub use buffer::{BufferLimits, PartitionBuffer, SealTrigger};
pub use commit::OffsetCommitCoordinator;
pub use config::{ArchiverConfig, RecordFormat, RenderErrorPolicy, RetryPolicy};
pub use error::{ArchiveError, Result};
pub use partition::{PartitionPipeline, PartitionState};
pub use reader::{ArchiveReader, LatestIndex};
pub use recovery::{RecoveredState, RecoveryManager};
pub use runtime::{ArchiverRuntime, RuntimeState};
pub use sealer::{ChunkGroup, ChunkSealer, SealedChunk};
pub use sink::ArchiveSink;
pub use store::StoreClient;
pub use traits::{OffsetCommitter, RecordSource, ResumeOffsets, SinkTask};
pub use uploader::{PublishedGroup, Uploader};

pub use archivist_core::{Chunk, IndexFile, ObjectKeys, SinkRecord, TopicPartition};
