//! Upstream offset commits.
//!
//! The committed offset of a partition only moves once the group covering it
//! is fully published, and it only moves forward. Commit failures never fail
//! the pipeline: the archive is already durable, so the coordinator keeps
//! retrying with capped backoff until the committer accepts the offset.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use archivist_core::{Chunk, TopicPartition};

use crate::config::RetryPolicy;
use crate::metrics;
use crate::traits::OffsetCommitter;

pub struct OffsetCommitCoordinator {
    committer: Arc<dyn OffsetCommitter>,
    backoff: RetryPolicy,
    committed: Mutex<HashMap<TopicPartition, u64>>,
}

impl OffsetCommitCoordinator {
    pub fn new(committer: Arc<dyn OffsetCommitter>, backoff: RetryPolicy) -> Self {
        Self {
            committer,
            backoff,
            committed: Mutex::new(HashMap::new()),
        }
    }

    /// Commit the offset following `chunk`, the last chunk of a group whose
    /// pointer update has completed.
    pub async fn after_publish(&self, tp: &TopicPartition, chunk: &Chunk) -> bool {
        self.advance(tp, chunk.next_offset()).await
    }

    /// Commit `offset` for `tp` unless an equal or later offset already was.
    /// Returns whether a commit was made.
    pub async fn advance(&self, tp: &TopicPartition, offset: u64) -> bool {
        if let Some(&current) = self.committed.lock().await.get(tp) {
            if offset <= current {
                tracing::debug!(
                    topic = %tp.topic,
                    partition = tp.partition,
                    offset,
                    committed = current,
                    "Ignoring stale commit request"
                );
                return false;
            }
        }

        let mut attempt = 0u32;
        while let Err(e) = self.committer.commit(tp, offset).await {
            let backoff = self.backoff.backoff_for(attempt);
            tracing::warn!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %e,
                "Offset commit failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt = attempt.saturating_add(1);
        }

        let mut committed = self.committed.lock().await;
        let entry = committed.entry(tp.clone()).or_insert(offset);
        *entry = (*entry).max(offset);

        let partition_label = tp.partition.to_string();
        metrics::COMMITTED_OFFSET
            .with_label_values(&[tp.topic.as_str(), partition_label.as_str()])
            .set(*entry as i64);
        tracing::debug!(topic = %tp.topic, partition = tp.partition, offset, "Committed offset");
        true
    }

    /// Last offset committed for `tp` by this coordinator.
    pub async fn committed(&self, tp: &TopicPartition) -> Option<u64> {
        self.committed.lock().await.get(tp).copied()
    }

    /// Drop the bookkeeping of a released partition.
    pub async fn forget(&self, tp: &TopicPartition) {
        self.committed.lock().await.remove(tp);
    }
}

impl std::fmt::Debug for OffsetCommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCommitCoordinator")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
