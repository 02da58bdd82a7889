//! Resume-point recovery.
//!
//! The pointer object is the only state read at startup. No pointer means
//! the partition was never archived and positioning is left to the upstream
//! consumer. A pointer that names a missing or invalid index is never
//! treated as a fresh partition: that would silently re-archive or skip data.

use archivist_core::{IndexFile, ObjectKeys, TopicPartition};

use crate::error::{ArchiveError, Result};
use crate::store::StoreClient;
use crate::uploader::PointerVersion;

/// What a restarted pipeline needs to continue a partition.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Offset of the first record not yet archived.
    pub resume_offset: Option<u64>,
    /// Key of the index the pointer names.
    pub index_key: Option<String>,
    pub index: Option<IndexFile>,
    /// Seed for the partition's chunk counter.
    pub chunk_index: u64,
    pub pointer: PointerVersion,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    client: StoreClient,
    keys: ObjectKeys,
}

impl RecoveryManager {
    pub fn new(client: StoreClient, keys: ObjectKeys) -> Self {
        Self { client, keys }
    }

    /// Offset to resume `tp` from, or `None` for a partition with no archive.
    pub async fn resume_offset(&self, tp: &TopicPartition) -> Result<Option<u64>> {
        Ok(self.recover(tp).await?.resume_offset)
    }

    /// Read the pointer of `tp` and the index it names.
    pub async fn recover(&self, tp: &TopicPartition) -> Result<RecoveredState> {
        let pointer_key = self.keys.pointer_key(tp);
        let pointer = match self.client.get(&pointer_key).await? {
            Some(pointer) => pointer,
            None => {
                tracing::info!(
                    topic = %tp.topic,
                    partition = tp.partition,
                    "No pointer found, partition starts fresh"
                );
                return Ok(RecoveredState::default());
            }
        };

        let index_key = std::str::from_utf8(&pointer.bytes)
            .map_err(|e| ArchiveError::CorruptIndex {
                key: pointer_key.clone(),
                reason: format!("pointer is not valid UTF-8: {}", e),
            })?
            .trim()
            .to_string();
        if index_key.is_empty() {
            return Err(ArchiveError::CorruptIndex {
                key: pointer_key,
                reason: "pointer is empty".to_string(),
            });
        }

        let raw = self
            .client
            .get(&index_key)
            .await?
            .ok_or_else(|| ArchiveError::CorruptIndex {
                key: index_key.clone(),
                reason: format!("named by '{}' but does not exist", pointer_key),
            })?;
        let index = IndexFile::from_json(&raw.bytes).map_err(|e| ArchiveError::CorruptIndex {
            key: index_key.clone(),
            reason: e.to_string(),
        })?;

        let resume_offset = index.next_offset();
        tracing::info!(
            topic = %tp.topic,
            partition = tp.partition,
            index_key = %index_key,
            resume_offset = ?resume_offset,
            "Recovered partition from pointer"
        );

        Ok(RecoveredState {
            resume_offset,
            index_key: Some(index_key),
            chunk_index: index.len() as u64,
            index: Some(index),
            pointer: PointerVersion {
                exists: true,
                version: pointer.version,
            },
        })
    }
}
