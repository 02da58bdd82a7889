//! Traits at the edges of the archive pipeline.
//!
//! `SinkTask` is what the runtime drives. `RecordSource` and
//! `OffsetCommitter` are the two halves of the upstream transport the
//! pipeline consumes: one hands over ordered batches, the other persists
//! the consumer position once data is durable.

use std::collections::HashMap;

use async_trait::async_trait;
use archivist_core::{SinkRecord, TopicPartition};

use crate::error::Result;

/// Resume position per assigned partition. `None` leaves positioning to the
/// upstream consumer's own committed offset.
pub type ResumeOffsets = HashMap<TopicPartition, Option<u64>>;

/// A sink driven by the runtime.
#[async_trait]
pub trait SinkTask: Send + Sync {
    /// Take ownership of `assignment` and report where each partition resumes.
    async fn start(&mut self, assignment: &[TopicPartition]) -> Result<ResumeOffsets>;

    /// Accept a batch of records.
    ///
    /// Records of one partition must be in offset order. Implementations may
    /// buffer and publish later.
    async fn put(&mut self, records: &[SinkRecord]) -> Result<()>;

    /// Publish everything buffered so far.
    async fn flush(&mut self) -> Result<()>;

    /// Release all partitions.
    async fn stop(&mut self) -> Result<()>;

    fn name(&self) -> &str;
}

/// Ordered batches of records from the upstream transport.
#[async_trait]
pub trait RecordSource: Send {
    /// Position the next poll of `tp` at `offset`.
    async fn seek(&mut self, tp: &TopicPartition, offset: u64) -> Result<()>;

    /// Next batch of records. Returns an empty vec when nothing is available.
    async fn poll(&mut self) -> Result<Vec<SinkRecord>>;

    /// Whether the source is finite and fully consumed. Unbounded sources
    /// keep the default.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Persists the upstream consumer position.
///
/// Shared between partitions and called from publish tasks, so it takes
/// `&self`.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Record that everything before `offset` on `tp` is archived.
    async fn commit(&self, tp: &TopicPartition, offset: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;

    // ---------------------------------------------------------------
    // Trait object safety
    // ---------------------------------------------------------------

    struct MockSink;

    #[async_trait]
    impl SinkTask for MockSink {
        async fn start(&mut self, assignment: &[TopicPartition]) -> Result<ResumeOffsets> {
            Ok(assignment.iter().map(|tp| (tp.clone(), None)).collect())
        }
        async fn put(&mut self, _records: &[SinkRecord]) -> Result<()> {
            Ok(())
        }
        async fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "mock-sink"
        }
    }

    struct MockSource {
        batches: Vec<Vec<SinkRecord>>,
        seeks: Vec<(TopicPartition, u64)>,
    }

    #[async_trait]
    impl RecordSource for MockSource {
        async fn seek(&mut self, tp: &TopicPartition, offset: u64) -> Result<()> {
            self.seeks.push((tp.clone(), offset));
            Ok(())
        }
        async fn poll(&mut self) -> Result<Vec<SinkRecord>> {
            Ok(self.batches.pop().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct MockCommitter {
        commits: Mutex<Vec<(TopicPartition, u64)>>,
    }

    #[async_trait]
    impl OffsetCommitter for MockCommitter {
        async fn commit(&self, tp: &TopicPartition, offset: u64) -> Result<()> {
            self.commits.lock().unwrap().push((tp.clone(), offset));
            Ok(())
        }
    }

    #[test]
    fn test_sink_task_object_safety() {
        let sink = MockSink;
        let _: &dyn SinkTask = &sink;
    }

    #[test]
    fn test_source_and_committer_object_safety() {
        let source = MockSource {
            batches: vec![],
            seeks: vec![],
        };
        let _: &dyn RecordSource = &source;
        let committer = MockCommitter::default();
        let _: &dyn OffsetCommitter = &committer;
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_mock_sink_lifecycle() {
        let mut sink = MockSink;
        let assignment = vec![TopicPartition::new("t", 0), TopicPartition::new("t", 1)];
        let offsets = sink.start(&assignment).await.unwrap();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[&TopicPartition::new("t", 1)], None);

        let records = vec![SinkRecord::new("t", 0, 0, 0, None, Bytes::from("test"))];
        sink.put(&records).await.unwrap();
        sink.flush().await.unwrap();
        sink.stop().await.unwrap();
        assert_eq!(sink.name(), "mock-sink");
    }

    #[tokio::test]
    async fn test_mock_source_seek_then_poll() {
        let mut source = MockSource {
            batches: vec![vec![SinkRecord::new("t", 0, 33, 0, None, Bytes::from("x"))]],
            seeks: vec![],
        };
        source.seek(&TopicPartition::new("t", 0), 33).await.unwrap();
        let batch = source.poll().await.unwrap();
        assert_eq!(batch[0].offset, 33);
        assert!(source.poll().await.unwrap().is_empty());
        assert_eq!(source.seeks, vec![(TopicPartition::new("t", 0), 33)]);
        assert!(!source.is_exhausted());
    }

    #[tokio::test]
    async fn test_committer_through_trait_object() {
        let committer = std::sync::Arc::new(MockCommitter::default());
        let shared: std::sync::Arc<dyn OffsetCommitter> = committer.clone();
        shared.commit(&TopicPartition::new("t", 2), 34).await.unwrap();
        assert_eq!(
            *committer.commits.lock().unwrap(),
            vec![(TopicPartition::new("t", 2), 34)]
        );
    }
}
