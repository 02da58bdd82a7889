//! File-backed record source and checkpoint committer.
//!
//! A line-delimited file stands in for one partition of the upstream
//! transport: line `n` (zero-based) is the record at offset `n`. The
//! checkpoint file plays the consumer's committed offset.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use archivist_sink::{ArchiveError, OffsetCommitter, RecordSource, SinkRecord, TopicPartition};

pub struct LineFileSource {
    tp: TopicPartition,
    lines: Vec<Bytes>,
    position: u64,
    timestamp: u64,
    batch_size: usize,
}

impl LineFileSource {
    /// Read `path` as partition `tp`. Every record carries the file's
    /// modification time, so re-archiving the same file yields the same keys.
    pub fn open(path: &Path, tp: TopicPartition, batch_size: usize) -> Result<Self> {
        let contents = std::fs::read(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat input file {}", path.display()))?;
        let timestamp = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let lines = split_lines(Bytes::from(contents));
        tracing::info!(
            input = %path.display(),
            topic = %tp.topic,
            partition = tp.partition,
            lines = lines.len(),
            "Opened input file"
        );
        Ok(Self {
            tp,
            lines,
            position: 0,
            timestamp,
            batch_size: batch_size.max(1),
        })
    }

    /// Start polling at `offset` instead of the first line.
    pub fn start_at(mut self, offset: u64) -> Self {
        self.position = offset;
        self
    }

    pub fn line_count(&self) -> u64 {
        self.lines.len() as u64
    }
}

/// Split on `\n`, dropping a trailing `\r` and the empty tail after the last
/// terminator.
fn split_lines(contents: Bytes) -> Vec<Bytes> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, b) in contents.iter().enumerate() {
        if *b == b'\n' {
            let end = if i > start && contents[i - 1] == b'\r' { i - 1 } else { i };
            lines.push(contents.slice(start..end));
            start = i + 1;
        }
    }
    if start < contents.len() {
        lines.push(contents.slice(start..));
    }
    lines
}

#[async_trait]
impl RecordSource for LineFileSource {
    async fn seek(&mut self, tp: &TopicPartition, offset: u64) -> archivist_sink::Result<()> {
        if *tp != self.tp {
            return Err(ArchiveError::NotAssigned {
                topic: tp.topic.clone(),
                partition: tp.partition,
            });
        }
        if offset > self.line_count() {
            tracing::warn!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                lines = self.line_count(),
                "Resume offset is past the end of the input"
            );
        }
        self.position = offset;
        Ok(())
    }

    async fn poll(&mut self) -> archivist_sink::Result<Vec<SinkRecord>> {
        let start = self.position.min(self.line_count());
        let end = (start + self.batch_size as u64).min(self.line_count());
        let records = (start..end)
            .map(|offset| {
                SinkRecord::new(
                    self.tp.topic.clone(),
                    self.tp.partition,
                    offset,
                    self.timestamp,
                    None,
                    self.lines[offset as usize].clone(),
                )
            })
            .collect::<Vec<_>>();
        self.position = self.position.max(end);
        Ok(records)
    }

    fn is_exhausted(&self) -> bool {
        self.position >= self.line_count()
    }
}

/// Stores the committed offset in a small text file.
pub struct CheckpointCommitter {
    path: PathBuf,
}

impl CheckpointCommitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Offset stored by a previous run, if any.
    pub fn read(&self) -> Result<Option<u64>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let offset = contents.trim().parse().with_context(|| {
                    format!("Invalid checkpoint file {}", self.path.display())
                })?;
                Ok(Some(offset))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }
}

#[async_trait]
impl OffsetCommitter for CheckpointCommitter {
    async fn commit(&self, tp: &TopicPartition, offset: u64) -> archivist_sink::Result<()> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{}\n", offset))
            .await
            .map_err(|e| ArchiveError::RuntimeError(format!("writing checkpoint: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ArchiveError::RuntimeError(format!("replacing checkpoint: {}", e)))?;
        tracing::debug!(topic = %tp.topic, partition = tp.partition, offset, "Checkpoint written");
        Ok(())
    }
}
