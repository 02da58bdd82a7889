//! Archive Sink
//!
//! `ArchiveSink` owns one [`PartitionPipeline`] per assigned partition and
//! implements [`SinkTask`]. A batch handed to `put` is split by partition;
//! partitions are processed concurrently, each behind its own mutex, and
//! share only the object store client, the commit coordinator and metrics.
//!
//! On `start` or `assign` every new partition is recovered from its pointer
//! before it accepts records. The returned resume offsets tell the caller
//! where to position the upstream consumer.
//!
//! ## Example
//!
//! ```ignore
//! let mut sink = ArchiveSink::new("archive", config, committer).with_store(store);
//! let resume = sink.start(&[TopicPartition::new("events", 0)]).await?;
//! sink.put(&records).await?;
//! sink.flush().await?;
//! sink.stop().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use object_store::ObjectStore;
use tokio::sync::Mutex;

use archivist_core::{ObjectKeys, SinkRecord, TopicPartition};

use crate::buffer::BufferLimits;
use crate::commit::OffsetCommitCoordinator;
use crate::config::ArchiverConfig;
use crate::error::{ArchiveError, Result};
use crate::metrics;
use crate::partition::{PartitionPipeline, PartitionState, PipelineContext};
use crate::recovery::RecoveryManager;
use crate::sealer::ChunkSealer;
use crate::store::StoreClient;
use crate::traits::{OffsetCommitter, ResumeOffsets, SinkTask};
use crate::uploader::Uploader;

type SharedPipeline = Arc<Mutex<PartitionPipeline>>;

/// Components built on `start`.
struct Started {
    ctx: PipelineContext,
    recovery: RecoveryManager,
}

pub struct ArchiveSink {
    name: String,
    config: ArchiverConfig,
    store: Option<Arc<dyn ObjectStore>>,
    committer: Arc<dyn OffsetCommitter>,
    started: Option<Started>,
    partitions: HashMap<TopicPartition, SharedPipeline>,
}

impl ArchiveSink {
    pub fn new(
        name: impl Into<String>,
        config: ArchiverConfig,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            store: None,
            committer,
            started: None,
            partitions: HashMap::new(),
        }
    }

    /// Use `store` instead of building an S3 client on `start`.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Take ownership of additional partitions.
    pub async fn assign(&mut self, assignment: &[TopicPartition]) -> Result<ResumeOffsets> {
        let started = self.started.as_ref().ok_or_else(not_started)?;

        let mut offsets = ResumeOffsets::new();
        let mut fresh = Vec::new();
        for tp in assignment {
            match self.partitions.get(tp) {
                Some(existing) => {
                    let state = existing.lock().await.state();
                    offsets.insert(tp.clone(), state.expected_next_offset);
                }
                None if !fresh.contains(tp) => fresh.push(tp.clone()),
                None => {}
            }
        }

        let recovered = try_join_all(fresh.iter().map(|tp| started.recovery.recover(tp))).await?;

        for (tp, state) in fresh.into_iter().zip(recovered) {
            offsets.insert(tp.clone(), state.resume_offset);
            tracing::info!(
                sink = %self.name,
                topic = %tp.topic,
                partition = tp.partition,
                resume_offset = ?state.resume_offset,
                "Assigned partition"
            );
            let pipeline = PartitionPipeline::new(tp.clone(), started.ctx.clone(), state);
            self.partitions.insert(tp, Arc::new(Mutex::new(pipeline)));
        }

        Ok(offsets)
    }

    /// Give up partitions. In-flight publishes complete; anything not yet
    /// published is dropped.
    pub async fn release(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            if let Some(pipeline) = self.partitions.remove(tp) {
                pipeline.lock().await.release().await;
                if let Some(started) = &self.started {
                    started.ctx.commits.forget(tp).await;
                }
            }
        }
        Ok(())
    }

    /// Currently owned partitions, sorted.
    pub fn assigned(&self) -> Vec<TopicPartition> {
        let mut tps: Vec<_> = self.partitions.keys().cloned().collect();
        tps.sort();
        tps
    }

    pub async fn partition_state(&self, tp: &TopicPartition) -> Option<PartitionState> {
        match self.partitions.get(tp) {
            Some(pipeline) => Some(pipeline.lock().await.state()),
            None => None,
        }
    }

    /// Last offset committed upstream for `tp` by this sink.
    pub async fn committed(&self, tp: &TopicPartition) -> Option<u64> {
        match &self.started {
            Some(started) => started.ctx.commits.committed(tp).await,
            None => None,
        }
    }

    fn build(&mut self) -> Result<Started> {
        self.config.validate()?;
        let store = match &self.store {
            Some(store) => store.clone(),
            None => {
                let store = self.config.build_s3_store()?;
                self.store = Some(store.clone());
                store
            }
        };

        let client = StoreClient::from_config(store, &self.config);
        let keys = ObjectKeys::new(&self.config.prefix);
        let uploader = Uploader::new(
            client.clone(),
            keys.clone(),
            self.config.conditional_pointer_writes,
        );
        let commits = OffsetCommitCoordinator::new(self.committer.clone(), self.config.commit_retry());

        Ok(Started {
            ctx: PipelineContext {
                limits: BufferLimits::from_config(&self.config),
                sealer: ChunkSealer::from_config(&self.config),
                group_max_chunks: self.config.group_max_chunks,
                uploader: Arc::new(uploader),
                commits: Arc::new(commits),
            },
            recovery: RecoveryManager::new(client, keys),
        })
    }
}

#[async_trait]
impl SinkTask for ArchiveSink {
    async fn start(&mut self, assignment: &[TopicPartition]) -> Result<ResumeOffsets> {
        metrics::init();
        if self.started.is_none() {
            let started = self.build()?;
            self.started = Some(started);
        }
        tracing::info!(
            sink = %self.name,
            bucket = %self.config.bucket,
            prefix = %self.config.prefix,
            partitions = assignment.len(),
            "Archive sink started"
        );
        self.assign(assignment).await
    }

    async fn put(&mut self, records: &[SinkRecord]) -> Result<()> {
        if self.started.is_none() {
            return Err(not_started());
        }

        let mut batches: HashMap<TopicPartition, Vec<SinkRecord>> = HashMap::new();
        for record in records {
            let tp = record.topic_partition();
            if !self.partitions.contains_key(&tp) {
                return Err(ArchiveError::NotAssigned {
                    topic: tp.topic,
                    partition: tp.partition,
                });
            }
            batches.entry(tp).or_default().push(record.clone());
        }

        // Every partition gets a turn so age thresholds fire without traffic
        let work: Vec<(SharedPipeline, Vec<SinkRecord>)> = self
            .partitions
            .iter()
            .map(|(tp, pipeline)| (pipeline.clone(), batches.remove(tp).unwrap_or_default()))
            .collect();

        let results = join_all(work.into_iter().map(|(pipeline, batch)| async move {
            let mut pipeline = pipeline.lock().await;
            if batch.is_empty() {
                pipeline.tick(Instant::now()).await
            } else {
                pipeline.append(&batch).await
            }
        }))
        .await;

        results.into_iter().collect()
    }

    async fn flush(&mut self) -> Result<()> {
        let pipelines: Vec<SharedPipeline> = self.partitions.values().cloned().collect();
        let results = join_all(
            pipelines
                .into_iter()
                .map(|pipeline| async move {
                    let mut pipeline = pipeline.lock().await;
                    pipeline.flush().await
                }),
        )
        .await;
        results.into_iter().collect()
    }

    async fn stop(&mut self) -> Result<()> {
        let assigned = self.assigned();
        self.release(&assigned).await?;
        tracing::info!(sink = %self.name, "Archive sink stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ArchiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSink")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("partitions", &self.assigned())
            .finish()
    }
}

fn not_started() -> ArchiveError {
    ArchiveError::RuntimeError("archive sink has not been started".to_string())
}
