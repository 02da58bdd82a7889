//! Group Publishing
//!
//! A group becomes visible in three writes, always in this order:
//!
//! 1. the payload object (concatenated gzip members)
//! 2. the index object describing the payload
//! 3. the partition's pointer, rewritten to name the new index
//!
//! A reader that follows the pointer therefore always finds a complete index
//! and payload. A crash between the writes leaves orphaned objects that no
//! pointer names; the next attempt derives the same keys from the same
//! offsets and overwrites them with identical bytes.
//!
//! With conditional pointer writes enabled, the pointer is written with
//! `PutMode::Create` when no pointer existed at recovery and with
//! `PutMode::Update` against the last known version otherwise. A conflict
//! means another writer owns the partition.

use bytes::Bytes;
use object_store::{PutMode, UpdateVersion};

use archivist_core::{IndexFile, ObjectKeys, TopicPartition};

use crate::error::{ArchiveError, Result};
use crate::metrics;
use crate::sealer::ChunkGroup;
use crate::store::{version_of, StoreCallError, StoreClient};

/// Pointer state carried from one publish of a partition to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerVersion {
    /// Whether a pointer object exists.
    pub exists: bool,
    /// Version reported by the store for the current pointer.
    pub version: Option<UpdateVersion>,
}

/// Outcome of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishedGroup {
    pub payload_key: String,
    pub index_key: String,
    pub index: IndexFile,
    pub pointer: PointerVersion,
}

impl PublishedGroup {
    /// Offset that follows the last published record.
    pub fn next_offset(&self) -> Option<u64> {
        self.index.next_offset()
    }
}

/// Writes groups to the object store.
#[derive(Debug, Clone)]
pub struct Uploader {
    client: StoreClient,
    keys: ObjectKeys,
    conditional_pointer_writes: bool,
}

impl Uploader {
    pub fn new(client: StoreClient, keys: ObjectKeys, conditional_pointer_writes: bool) -> Self {
        Self {
            client,
            keys,
            conditional_pointer_writes,
        }
    }

    pub fn keys(&self) -> &ObjectKeys {
        &self.keys
    }

    /// Publish `group` and advance the pointer. `pointer` is the state left
    /// by recovery or by the previous publish of the same partition.
    pub async fn publish(&self, group: &ChunkGroup, pointer: &PointerVersion) -> Result<PublishedGroup> {
        let tp = group.topic_partition();
        let (first_offset, first_timestamp) = match (group.first_offset(), group.first_timestamp()) {
            (Some(offset), Some(ts)) => (offset, ts),
            _ => {
                return Err(ArchiveError::RuntimeError(format!(
                    "cannot publish an empty group for {}",
                    tp
                )))
            }
        };

        let payload_key = self.keys.payload_key(tp, first_offset, first_timestamp)?;
        let index_key = self.keys.index_key(tp, first_offset, first_timestamp)?;
        let index = group.index().clone();
        let index_bytes = Bytes::from(index.to_json()?);
        let payload = group.payload();

        self.client
            .put("put_payload", &payload_key, payload.clone())
            .await?;
        tracing::debug!(
            topic = %tp.topic,
            partition = tp.partition,
            key = %payload_key,
            size = payload.len(),
            "Payload written"
        );

        self.client
            .put("put_index", &index_key, index_bytes)
            .await?;
        tracing::debug!(
            topic = %tp.topic,
            partition = tp.partition,
            key = %index_key,
            chunks = index.len(),
            "Index written"
        );

        let pointer = self.write_pointer(tp, &index_key, pointer).await?;

        let partition_label = tp.partition.to_string();
        metrics::GROUPS_PUBLISHED_TOTAL
            .with_label_values(&[tp.topic.as_str(), partition_label.as_str()])
            .inc();
        tracing::info!(
            topic = %tp.topic,
            partition = tp.partition,
            first_offset,
            next_offset = index.next_offset().unwrap_or(first_offset),
            chunks = index.len(),
            index_key = %index_key,
            "Published chunk group"
        );

        Ok(PublishedGroup {
            payload_key,
            index_key,
            index,
            pointer,
        })
    }

    async fn write_pointer(
        &self,
        tp: &TopicPartition,
        index_key: &str,
        current: &PointerVersion,
    ) -> Result<PointerVersion> {
        let pointer_key = self.keys.pointer_key(tp);
        let body = Bytes::from(index_key.to_string());

        if !self.conditional_pointer_writes {
            let result = self.client.put("put_pointer", &pointer_key, body).await?;
            return Ok(PointerVersion {
                exists: true,
                version: version_of(result.e_tag, result.version),
            });
        }

        let mode = match (current.exists, &current.version) {
            (false, _) => PutMode::Create,
            (true, Some(version)) => PutMode::Update(version.clone()),
            (true, None) => {
                return Err(ArchiveError::ConfigError(format!(
                    "store reported no version for pointer '{}', conditional writes are unavailable",
                    pointer_key
                )))
            }
        };

        match self
            .client
            .put_with_mode("put_pointer", &pointer_key, body, mode)
            .await
        {
            Ok(result) => Ok(PointerVersion {
                exists: true,
                version: version_of(result.e_tag, result.version),
            }),
            Err(StoreCallError::Permanent { source, attempt }) if is_conflict(&source) => {
                if attempt > 0 {
                    // An earlier attempt may have landed before its response was lost
                    if let Some(current) = self.client.get(&pointer_key).await? {
                        if current.bytes.as_ref() == index_key.as_bytes() {
                            tracing::info!(
                                topic = %tp.topic,
                                partition = tp.partition,
                                pointer_key = %pointer_key,
                                "Pointer already names the new index after a retried write"
                            );
                            return Ok(PointerVersion {
                                exists: true,
                                version: current.version,
                            });
                        }
                    }
                }
                tracing::error!(
                    topic = %tp.topic,
                    partition = tp.partition,
                    pointer_key = %pointer_key,
                    error = %source,
                    "Pointer changed underneath us, another writer owns this partition"
                );
                Err(ArchiveError::ConcurrentWriter { pointer_key })
            }
            Err(e) => Err(e.into_publish_error(&pointer_key)),
        }
    }
}

fn is_conflict(e: &object_store::Error) -> bool {
    matches!(
        e,
        object_store::Error::Precondition { .. } | object_store::Error::AlreadyExists { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecordFormat, RenderErrorPolicy, RetryPolicy};
    use crate::sealer::ChunkSealer;
    use archivist_core::{codec, SinkRecord};
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::ObjectStore;
    use std::sync::Arc;
    use std::time::Duration;

    const TS: u64 = 1_700_000_000_000;

    fn uploader(store: Arc<dyn ObjectStore>, conditional: bool) -> Uploader {
        let client = StoreClient::new(
            store,
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            Duration::from_secs(5),
        );
        Uploader::new(client, ObjectKeys::new("systest"), conditional)
    }

    fn group(partition: u32, first: u64, n: u64) -> ChunkGroup {
        let tp = TopicPartition::new("test-topic", partition);
        let records: Vec<_> = (first..first + n)
            .map(|o| {
                SinkRecord::new(
                    "test-topic",
                    partition,
                    o,
                    TS,
                    None,
                    Bytes::from(format!(r#"{{"foo": "bar", "counter":{}}}"#, 200 + o)),
                )
            })
            .collect();
        let sealer = ChunkSealer::new(RecordFormat::Value, RenderErrorPolicy::Fail);
        let mut group = ChunkGroup::new(tp);
        group.push(sealer.seal(&records, 0).unwrap()).unwrap();
        group
    }

    async fn read(store: &Arc<dyn ObjectStore>, key: &str) -> Bytes {
        store
            .get(&Path::from(key))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap()
    }

    // ---------------------------------------------------------------
    // Publishing
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_publish_writes_all_three_objects() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store.clone(), false);
        let group = group(0, 0, 33);

        let published = uploader.publish(&group, &PointerVersion::default()).await.unwrap();
        assert_eq!(
            published.payload_key,
            "systest/2023-11-14/test-topic-00000-000000000000.gz"
        );
        assert_eq!(
            published.index_key,
            "systest/2023-11-14/test-topic-00000-000000000000.index.json"
        );
        assert_eq!(published.next_offset(), Some(33));
        assert!(published.pointer.exists);

        let pointer = read(&store, "systest/last_chunk_index.test-topic-00000.txt").await;
        assert_eq!(pointer.as_ref(), published.index_key.as_bytes());

        let index = IndexFile::from_json(&read(&store, &published.index_key).await).unwrap();
        assert_eq!(index.chunks[0].byte_length_uncompressed, 990);

        let payload = read(&store, &published.payload_key).await;
        assert_eq!(payload.len() as u64, index.chunks[0].byte_length);
        assert_eq!(codec::decode_payload(&payload).unwrap().len(), 990);
    }

    #[tokio::test]
    async fn test_republish_is_byte_identical() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store.clone(), false);

        let first = uploader.publish(&group(1, 0, 10), &PointerVersion::default()).await.unwrap();
        let payload_a = read(&store, &first.payload_key).await;
        let index_a = read(&store, &first.index_key).await;

        let second = uploader.publish(&group(1, 0, 10), &first.pointer).await.unwrap();
        assert_eq!(first.payload_key, second.payload_key);
        assert_eq!(first.index_key, second.index_key);
        assert_eq!(payload_a, read(&store, &second.payload_key).await);
        assert_eq!(index_a, read(&store, &second.index_key).await);
    }

    #[tokio::test]
    async fn test_empty_group_rejected() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store, false);
        let empty = ChunkGroup::new(TopicPartition::new("t", 0));
        assert!(uploader.publish(&empty, &PointerVersion::default()).await.is_err());
    }

    // ---------------------------------------------------------------
    // Conditional pointer writes
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_conditional_writes_chain_versions() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store, true);

        let first = uploader.publish(&group(0, 0, 5), &PointerVersion::default()).await.unwrap();
        assert!(first.pointer.version.is_some());
        let second = uploader.publish(&group(0, 5, 5), &first.pointer).await.unwrap();
        assert_ne!(first.pointer.version, second.pointer.version);
    }

    #[tokio::test]
    async fn test_conditional_create_detects_existing_pointer() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        store
            .put(
                &Path::from("systest/last_chunk_index.test-topic-00000.txt"),
                Bytes::from_static(b"someone-else"),
            )
            .await
            .unwrap();

        let uploader = uploader(store, true);
        let err = uploader
            .publish(&group(0, 0, 5), &PointerVersion::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ConcurrentWriter { .. }));
    }

    #[tokio::test]
    async fn test_conditional_update_detects_stale_version() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let uploader = uploader(store.clone(), true);
        let first = uploader.publish(&group(0, 0, 5), &PointerVersion::default()).await.unwrap();

        // A second writer moves the pointer
        store
            .put(
                &Path::from("systest/last_chunk_index.test-topic-00000.txt"),
                Bytes::from_static(b"elsewhere"),
            )
            .await
            .unwrap();

        let err = uploader.publish(&group(0, 5, 5), &first.pointer).await.unwrap_err();
        assert!(matches!(err, ArchiveError::ConcurrentWriter { .. }));
    }
}
