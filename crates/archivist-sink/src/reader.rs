//! Archive Reader
//!
//! Read side of the archive. Everything a reader trusts is reachable from a
//! partition's pointer: pointer → index → payload. Index objects with no
//! pointer behind them (a publish that crashed before its pointer update)
//! are ignored, since a restarted pipeline overwrites them.
//!
//! ## Usage
//!
//! ```ignore
//! let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));
//! let tp = TopicPartition::new("events", 0);
//!
//! if let Some(latest) = reader.latest(&tp).await? {
//!     let first = &latest.index.chunks[0];
//!     let lines = reader.read_chunk(&latest.index_key, first).await?;
//! }
//! let everything = reader.read_partition(&tp).await?;
//! ```

use archivist_core::{codec, Chunk, IndexFile, ObjectKeys, TopicPartition};
use bytes::Bytes;

use crate::error::{ArchiveError, Result};
use crate::recovery::RecoveryManager;
use crate::store::StoreClient;

/// The index a partition's pointer currently names.
#[derive(Debug, Clone)]
pub struct LatestIndex {
    pub index_key: String,
    pub index: IndexFile,
}

#[derive(Debug, Clone)]
pub struct ArchiveReader {
    client: StoreClient,
    keys: ObjectKeys,
    recovery: RecoveryManager,
}

impl ArchiveReader {
    pub fn new(client: StoreClient, keys: ObjectKeys) -> Self {
        let recovery = RecoveryManager::new(client.clone(), keys.clone());
        Self {
            client,
            keys,
            recovery,
        }
    }

    /// Resolve the pointer of `tp`. `None` when the partition has no archive.
    pub async fn latest(&self, tp: &TopicPartition) -> Result<Option<LatestIndex>> {
        let state = self.recovery.recover(tp).await?;
        Ok(match (state.index_key, state.index) {
            (Some(index_key), Some(index)) => Some(LatestIndex { index_key, index }),
            _ => None,
        })
    }

    /// Fetch and parse an index object.
    pub async fn read_index(&self, index_key: &str) -> Result<IndexFile> {
        let raw = self
            .client
            .get(index_key)
            .await?
            .ok_or_else(|| ArchiveError::CorruptIndex {
                key: index_key.to_string(),
                reason: "index does not exist".to_string(),
            })?;
        IndexFile::from_json(&raw.bytes).map_err(|e| ArchiveError::CorruptIndex {
            key: index_key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decompressed lines of one chunk, fetched by byte range from the
    /// payload paired with `index_key`.
    pub async fn read_chunk(&self, index_key: &str, chunk: &Chunk) -> Result<Bytes> {
        let payload_key = ObjectKeys::payload_key_for_index(index_key)?;
        let range = chunk.byte_range();
        let start = usize::try_from(range.start).map_err(|_| corrupt_range(index_key, chunk))?;
        let end = usize::try_from(range.end).map_err(|_| corrupt_range(index_key, chunk))?;

        let member = self.client.get_range(&payload_key, start..end).await?;
        if member.len() as u64 != chunk.byte_length {
            return Err(ArchiveError::CorruptIndex {
                key: index_key.to_string(),
                reason: format!(
                    "chunk at byte {} expects {} bytes, payload returned {}",
                    chunk.byte_offset,
                    chunk.byte_length,
                    member.len()
                ),
            });
        }

        let data = codec::decode_member(&member)?;
        if data.len() as u64 != chunk.byte_length_uncompressed {
            return Err(ArchiveError::CorruptIndex {
                key: index_key.to_string(),
                reason: format!(
                    "chunk at offset {} decompresses to {} bytes, index says {}",
                    chunk.first_record_offset,
                    data.len(),
                    chunk.byte_length_uncompressed
                ),
            });
        }
        Ok(Bytes::from(data))
    }

    /// Every index key of `tp` in the store, ordered by first offset and
    /// then by key, including ones no pointer has reached yet. Two keys can
    /// share a first offset when an abandoned publish left an index under an
    /// older date.
    pub async fn list_indexes(&self, tp: &TopicPartition) -> Result<Vec<(u64, String)>> {
        let objects = self.client.list(self.keys.prefix()).await?;
        let mut indexes: Vec<(u64, String)> = objects
            .into_iter()
            .filter_map(|meta| {
                let key = meta.location.to_string();
                ObjectKeys::first_offset_of_index(tp, &key).map(|offset| (offset, key))
            })
            .collect();
        indexes.sort();
        Ok(indexes)
    }

    /// All archived lines of `tp` in offset order, newline-terminated.
    ///
    /// Starts at the index the pointer names and walks back through indexes
    /// whose offsets end exactly where the later one begins. Fails with
    /// `CorruptIndex` if no index closes a gap.
    pub async fn read_partition(&self, tp: &TopicPartition) -> Result<Bytes> {
        let latest = match self.latest(tp).await? {
            Some(latest) => latest,
            None => return Ok(Bytes::new()),
        };

        let mut candidates = self.list_indexes(tp).await?;
        let mut chain = vec![(latest.index_key, latest.index)];
        while let Some(first) = chain.last().and_then(|(_, index)| index.first_offset()) {
            candidates.retain(|(offset, _)| *offset < first);
            if candidates.is_empty() {
                if first != 0 {
                    tracing::debug!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        first_offset = first,
                        "Archive starts past offset 0"
                    );
                }
                break;
            }

            let mut previous = None;
            for (_, index_key) in candidates.iter().rev() {
                match self.read_index(index_key).await {
                    Ok(index) if index.next_offset() == Some(first) => {
                        previous = Some((index_key.clone(), index));
                        break;
                    }
                    Err(ArchiveError::CorruptIndex { .. }) | Ok(_) => {}
                    Err(e) => return Err(e),
                }
                tracing::debug!(
                    topic = %tp.topic,
                    partition = tp.partition,
                    index_key = %index_key,
                    "Skipping index outside the pointer chain"
                );
            }
            match previous {
                Some(previous) => chain.push(previous),
                None => {
                    let (index_key, _) = &chain[chain.len() - 1];
                    return Err(ArchiveError::CorruptIndex {
                        key: index_key.clone(),
                        reason: format!("no earlier index ends at offset {}", first),
                    });
                }
            }
        }

        let mut out = Vec::new();
        for (index_key, index) in chain.iter().rev() {
            for chunk in &index.chunks {
                out.extend_from_slice(&self.read_chunk(index_key, chunk).await?);
            }
        }
        Ok(Bytes::from(out))
    }
}

fn corrupt_range(index_key: &str, chunk: &Chunk) -> ArchiveError {
    ArchiveError::CorruptIndex {
        key: index_key.to_string(),
        reason: format!("byte range {:?} does not fit in memory", chunk.byte_range()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecordFormat, RenderErrorPolicy, RetryPolicy};
    use crate::sealer::{ChunkGroup, ChunkSealer};
    use crate::uploader::{PointerVersion, Uploader};
    use archivist_core::SinkRecord;
    use object_store::memory::InMemory;
    use std::sync::Arc;
    use std::time::Duration;

    const TS: u64 = 1_700_000_000_000;

    fn client() -> StoreClient {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        StoreClient::new(Arc::new(InMemory::new()), retry, Duration::from_secs(5))
    }

    fn records(first: u64, n: u64) -> Vec<SinkRecord> {
        (first..first + n)
            .map(|o| {
                let value = format!("{{\"foo\": \"bar\", \"counter\":{}}}", 200 + o);
                SinkRecord::new("t", 0, o, TS, None, Bytes::from(value))
            })
            .collect()
    }

    /// Publish groups of `sizes` chunks back to back, starting at offset 0.
    async fn publish(client: &StoreClient, groups: &[&[u64]]) -> Uploader {
        let uploader = Uploader::new(client.clone(), ObjectKeys::new("systest"), false);
        let sealer = ChunkSealer::new(RecordFormat::Value, RenderErrorPolicy::Fail);
        let tp = TopicPartition::new("t", 0);
        let mut offset = 0;
        for sizes in groups {
            let mut group = ChunkGroup::new(tp.clone());
            for &n in sizes.iter() {
                let sealed = sealer.seal(&records(offset, n), group.next_byte_offset()).unwrap();
                group.push(sealed).unwrap();
                offset += n;
            }
            uploader.publish(&group, &PointerVersion::default()).await.unwrap();
        }
        uploader
    }

    /// Publish one single-chunk group of `n` records from `first`, dated by `ts`.
    async fn publish_at(client: &StoreClient, first: u64, n: u64, ts: u64) {
        let uploader = Uploader::new(client.clone(), ObjectKeys::new("systest"), false);
        let sealer = ChunkSealer::new(RecordFormat::Value, RenderErrorPolicy::Fail);
        let batch: Vec<SinkRecord> = records(first, n)
            .into_iter()
            .map(|r| SinkRecord::new("t", 0, r.offset, ts, None, r.value))
            .collect();
        let mut group = ChunkGroup::new(TopicPartition::new("t", 0));
        group.push(sealer.seal(&batch, 0).unwrap()).unwrap();
        uploader.publish(&group, &PointerVersion::default()).await.unwrap();
    }

    // ---------------------------------------------------------------
    // Pointer resolution
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_latest_on_empty_partition() {
        let reader = ArchiveReader::new(client(), ObjectKeys::new("systest"));
        assert!(reader.latest(&TopicPartition::new("t", 0)).await.unwrap().is_none());
        assert!(reader
            .read_partition(&TopicPartition::new("t", 0))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_latest_resolves_pointer() {
        let client = client();
        publish(&client, &[&[33], &[10]]).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));

        let latest = reader.latest(&TopicPartition::new("t", 0)).await.unwrap().unwrap();
        assert_eq!(latest.index_key, "systest/2023-11-14/t-00000-000000000033.index.json");
        assert_eq!(latest.index.next_offset(), Some(43));
    }

    // ---------------------------------------------------------------
    // Chunk and partition reads
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_read_single_chunk_by_range() {
        let client = client();
        publish(&client, &[&[5, 7]]).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));

        let latest = reader.latest(&TopicPartition::new("t", 0)).await.unwrap().unwrap();
        let second = &latest.index.chunks[1];
        let data = reader.read_chunk(&latest.index_key, second).await.unwrap();
        let text = std::str::from_utf8(&data).unwrap();
        assert_eq!(text.lines().count(), 7);
        assert!(text.starts_with("{\"foo\": \"bar\", \"counter\":205}\n"));
    }

    #[tokio::test]
    async fn test_list_indexes_in_offset_order() {
        let client = client();
        publish(&client, &[&[3], &[4], &[5]]).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));

        let offsets: Vec<u64> = reader
            .list_indexes(&TopicPartition::new("t", 0))
            .await
            .unwrap()
            .into_iter()
            .map(|(offset, _)| offset)
            .collect();
        assert_eq!(offsets, vec![0, 3, 7]);
        assert!(reader
            .list_indexes(&TopicPartition::new("t", 1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_read_partition_concatenates_in_order() {
        let client = client();
        publish(&client, &[&[3, 4], &[5]]).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));

        let data = reader.read_partition(&TopicPartition::new("t", 0)).await.unwrap();
        let counters: Vec<u64> = std::str::from_utf8(&data)
            .unwrap()
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                v["counter"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(counters, (200..212).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_read_partition_ignores_abandoned_index_at_same_offset() {
        let client = client();
        // Abandoned run: its index is overwritten in the pointer by a later
        // run that restarted at the same offset on the next day.
        publish_at(&client, 0, 2, TS).await;
        publish_at(&client, 0, 3, 1_700_006_400_000).await;
        publish_at(&client, 3, 2, 1_700_006_400_000).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));
        let tp = TopicPartition::new("t", 0);

        let keys: Vec<String> = reader
            .list_indexes(&tp)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "systest/2023-11-14/t-00000-000000000000.index.json",
                "systest/2023-11-15/t-00000-000000000000.index.json",
                "systest/2023-11-15/t-00000-000000000003.index.json",
            ]
        );

        let data = reader.read_partition(&tp).await.unwrap();
        let counters: Vec<u64> = std::str::from_utf8(&data)
            .unwrap()
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                v["counter"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(counters, (200..205).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_read_partition_detects_gap() {
        let client = client();
        publish_at(&client, 0, 3, TS).await;
        publish_at(&client, 5, 2, TS).await;
        let reader = ArchiveReader::new(client, ObjectKeys::new("systest"));

        let err = reader.read_partition(&TopicPartition::new("t", 0)).await.unwrap_err();
        match err {
            ArchiveError::CorruptIndex { key, reason } => {
                assert_eq!(key, "systest/2023-11-14/t-00000-000000000005.index.json");
                assert!(reason.contains("offset 5"), "{}", reason);
            }
            other => panic!("expected CorruptIndex, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_chunk_detects_truncated_payload() {
        let client = client();
        publish(&client, &[&[5]]).await;
        let reader = ArchiveReader::new(client.clone(), ObjectKeys::new("systest"));
        let latest = reader.latest(&TopicPartition::new("t", 0)).await.unwrap().unwrap();

        let payload_key = ObjectKeys::payload_key_for_index(&latest.index_key).unwrap();
        client
            .put("test", &payload_key, Bytes::from_static(b"short"))
            .await
            .unwrap();

        let err = reader
            .read_chunk(&latest.index_key, &latest.index.chunks[0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::ReadFailed { .. }
                | ArchiveError::CorruptIndex { .. }
                | ArchiveError::ObjectStoreError(_)
        ));
    }
}
