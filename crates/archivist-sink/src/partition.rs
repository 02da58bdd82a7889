//! Partition Pipeline
//!
//! One `PartitionPipeline` owns all archive state of one partition: the open
//! buffer, the open chunk group and at most one in-flight publish.
//!
//! ## Flow
//!
//! ```text
//! append ──► PartitionBuffer ──(threshold)──► ChunkSealer ──► ChunkGroup
//!                                                               │
//!                            (group full, age seal or flush)    ▼
//!                                         spawn: Uploader.publish ──► commit
//! ```
//!
//! The publish of group N runs in a spawned task while the buffer keeps
//! accumulating. Before group N+1 is handed to the uploader, the task of
//! group N is awaited, so pointer updates and commits of one partition never
//! overtake each other.
//!
//! Any error that reaches the pipeline marks the partition failed. A failed
//! partition rejects further records and flushes until it is released.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use archivist_core::{SinkRecord, TopicPartition};

use crate::buffer::{BufferLimits, PartitionBuffer, SealTrigger};
use crate::commit::OffsetCommitCoordinator;
use crate::error::{ArchiveError, Result};
use crate::metrics;
use crate::recovery::RecoveredState;
use crate::sealer::{ChunkGroup, ChunkSealer};
use crate::uploader::{PointerVersion, PublishedGroup, Uploader};

/// Snapshot of a partition's archive state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    pub topic: String,
    pub partition: u32,
    /// Number of chunks sealed, seeded from recovery.
    pub chunk_index: u64,
    /// Index key the pointer named after the last completed publish.
    pub last_sealed_index_key: Option<String>,
    pub expected_next_offset: Option<u64>,
    pub buffered_records: usize,
    /// Chunks sealed into the open group but not yet handed to the uploader.
    pub pending_chunks: usize,
    pub publish_in_flight: bool,
    pub failed: bool,
}

/// Components shared by the pipelines of one sink.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub limits: BufferLimits,
    pub sealer: ChunkSealer,
    pub group_max_chunks: usize,
    pub uploader: Arc<Uploader>,
    pub commits: Arc<OffsetCommitCoordinator>,
}

pub struct PartitionPipeline {
    tp: TopicPartition,
    ctx: PipelineContext,
    buffer: PartitionBuffer,
    group: Option<ChunkGroup>,
    in_flight: Option<JoinHandle<Result<PublishedGroup>>>,
    pointer: PointerVersion,
    chunk_index: u64,
    last_sealed_index_key: Option<String>,
    published_next_offset: Option<u64>,
    failed: bool,
}

impl PartitionPipeline {
    /// Create the pipeline of `tp`, continuing from `recovered`.
    pub fn new(tp: TopicPartition, ctx: PipelineContext, recovered: RecoveredState) -> Self {
        let buffer = PartitionBuffer::new(tp.clone(), ctx.limits)
            .with_expected_offset(recovered.resume_offset);
        Self {
            tp,
            ctx,
            buffer,
            group: None,
            in_flight: None,
            pointer: recovered.pointer,
            chunk_index: recovered.chunk_index,
            last_sealed_index_key: recovered.index_key,
            published_next_offset: recovered.resume_offset,
            failed: false,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn state(&self) -> PartitionState {
        PartitionState {
            topic: self.tp.topic.clone(),
            partition: self.tp.partition,
            chunk_index: self.chunk_index,
            last_sealed_index_key: self.last_sealed_index_key.clone(),
            expected_next_offset: self.buffer.expected_next_offset(),
            buffered_records: self.buffer.len(),
            pending_chunks: self.group.as_ref().map(ChunkGroup::len).unwrap_or(0),
            publish_in_flight: self.in_flight.is_some(),
            failed: self.failed,
        }
    }

    /// Append a batch of this partition's records, sealing and publishing as
    /// thresholds are crossed.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(topic = %self.tp.topic, partition = self.tp.partition, count = records.len())
    )]
    pub async fn append(&mut self, records: &[SinkRecord]) -> Result<()> {
        self.ensure_healthy()?;

        for record in records {
            let due = match self.buffer.append(record.clone()) {
                Ok(due) => due,
                Err(e) => return Err(self.fail(e)),
            };
            metrics::RECORDS_APPENDED_TOTAL
                .with_label_values(&[self.tp.topic.as_str()])
                .inc();
            if due {
                let trigger = self.buffer.trigger_at(Instant::now());
                self.seal(trigger).await?;
            }
        }

        self.tick(Instant::now()).await
    }

    /// Seal the buffer if its age threshold has passed.
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        self.ensure_healthy()?;
        if self.buffer.is_expired(now) {
            self.seal(Some(SealTrigger::Age)).await?;
        }
        Ok(())
    }

    /// Seal whatever is buffered, publish the open group and wait until every
    /// publish of this partition has completed.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_healthy()?;
        if !self.buffer.is_empty() {
            self.seal(None).await?;
        }
        if self.group.as_ref().map(|g| !g.is_empty()).unwrap_or(false) {
            self.close_group().await?;
        }
        self.await_in_flight().await
    }

    /// Stop archiving this partition. Waits for the in-flight publish, then
    /// drops the unsealed tail and any sealed but unpublished chunks; they
    /// will be redelivered from the committed offset.
    pub async fn release(&mut self) {
        if let Err(e) = self.await_in_flight().await {
            tracing::warn!(
                topic = %self.tp.topic,
                partition = self.tp.partition,
                error = %e,
                "In-flight publish failed during release"
            );
        }

        let dropped_records = self.buffer.discard();
        let dropped_chunks = self.group.take().map(|g| g.len()).unwrap_or(0);
        self.buffer.rewind(self.published_next_offset);
        tracing::info!(
            topic = %self.tp.topic,
            partition = self.tp.partition,
            dropped_records,
            dropped_chunks,
            "Released partition"
        );
    }

    /// `None` means the seal was requested by a flush.
    async fn seal(&mut self, trigger: Option<SealTrigger>) -> Result<()> {
        let records = self.buffer.take();
        if records.is_empty() {
            return Ok(());
        }

        let group = self
            .group
            .get_or_insert_with(|| ChunkGroup::new(self.tp.clone()));
        let sealed = match self.ctx.sealer.seal(&records, group.next_byte_offset()) {
            Ok(sealed) => sealed,
            Err(e) => return Err(self.fail(e)),
        };
        let chunk = sealed.chunk;
        if let Err(e) = group.push(sealed) {
            return Err(self.fail(e.into()));
        }
        let group_len = group.len();
        self.chunk_index += 1;

        let trigger_label = trigger.map(|t| t.as_str()).unwrap_or("flush");
        metrics::CHUNKS_SEALED_TOTAL
            .with_label_values(&[self.tp.topic.as_str(), trigger_label])
            .inc();
        metrics::SEALED_BYTES_TOTAL
            .with_label_values(&[self.tp.topic.as_str(), "uncompressed"])
            .inc_by(chunk.byte_length_uncompressed);
        metrics::SEALED_BYTES_TOTAL
            .with_label_values(&[self.tp.topic.as_str(), "compressed"])
            .inc_by(chunk.byte_length);
        tracing::info!(
            topic = %self.tp.topic,
            partition = self.tp.partition,
            chunk_index = self.chunk_index,
            first_offset = chunk.first_record_offset,
            num_records = chunk.num_records,
            byte_length = chunk.byte_length,
            trigger = trigger_label,
            "Sealed chunk"
        );

        let close = group_len >= self.ctx.group_max_chunks || trigger == Some(SealTrigger::Age);
        if close {
            self.close_group().await?;
        }
        Ok(())
    }

    /// Hand the open group to a publish task once the previous one is done.
    async fn close_group(&mut self) -> Result<()> {
        let group = match self.group.take() {
            Some(group) if !group.is_empty() => group,
            _ => return Ok(()),
        };

        self.await_in_flight().await?;

        let uploader = self.ctx.uploader.clone();
        let commits = self.ctx.commits.clone();
        let pointer = self.pointer.clone();
        let tp = self.tp.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let published = uploader.publish(&group, &pointer).await?;
            if let Some(last) = published.index.last() {
                commits.after_publish(&tp, last).await;
            }
            Ok::<_, ArchiveError>(published)
        }));
        Ok(())
    }

    async fn await_in_flight(&mut self) -> Result<()> {
        let handle = match self.in_flight.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        match handle.await {
            Ok(Ok(published)) => {
                self.published_next_offset = published.next_offset();
                self.pointer = published.pointer;
                self.last_sealed_index_key = Some(published.index_key);
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(join_err) => Err(self.fail(ArchiveError::RuntimeError(format!(
                "publish task failed: {}",
                join_err
            )))),
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.failed {
            return Err(ArchiveError::PartitionFailed {
                topic: self.tp.topic.clone(),
                partition: self.tp.partition,
            });
        }
        Ok(())
    }

    fn fail(&mut self, err: ArchiveError) -> ArchiveError {
        self.failed = true;
        let reason = failure_reason(&err);
        metrics::PARTITION_FAILURES_TOTAL
            .with_label_values(&[self.tp.topic.as_str(), reason])
            .inc();
        tracing::error!(
            topic = %self.tp.topic,
            partition = self.tp.partition,
            error = %err,
            "Partition failed"
        );
        err
    }
}

impl std::fmt::Debug for PartitionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionPipeline")
            .field("tp", &self.tp)
            .field("state", &self.state())
            .finish()
    }
}

fn failure_reason(err: &ArchiveError) -> &'static str {
    match err {
        ArchiveError::OrderingViolation { .. } => "ordering",
        ArchiveError::RenderError { .. } => "render",
        ArchiveError::PublishFailed { .. } | ArchiveError::ObjectStoreError(_) => "publish",
        ArchiveError::ConcurrentWriter { .. } => "concurrent_writer",
        _ => "other",
    }
}
