//! Chunk Sealing
//!
//! `ChunkSealer` renders a run of records as newline-terminated lines and
//! compresses them into one gzip member. `ChunkGroup` collects sealed chunks
//! that will share a payload object and keeps their index in step with the
//! concatenated payload bytes.
//!
//! ## Rendering
//!
//! - `value`: the record value as UTF-8 text. A value that is not valid UTF-8
//!   or that contains a newline cannot be one line and is unrenderable.
//! - `json`: `{"topic":..,"partition":..,"offset":..,"timestamp":..,"key":..,"value":..}`
//!   on one line. Key and value must be valid UTF-8.
//!
//! Unrenderable records either fail the seal or are left out of the payload,
//! depending on [`RenderErrorPolicy`]. A skipped record still counts towards
//! `num_records`, so the chunk keeps covering a contiguous offset range.

use bytes::{Bytes, BytesMut};

use archivist_core::codec;
use archivist_core::{Chunk, IndexFile, SinkRecord, TopicPartition};

use crate::config::{ArchiverConfig, RecordFormat, RenderErrorPolicy};
use crate::error::{ArchiveError, Result};
use crate::metrics;

/// A chunk descriptor together with its compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    pub chunk: Chunk,
    /// The chunk's gzip member.
    pub payload: Bytes,
    /// Records covered by the chunk but left out of the payload.
    pub skipped: u64,
    /// Timestamp of the chunk's first record.
    pub first_timestamp: u64,
}

/// Turns buffered records into sealed chunks.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSealer {
    format: RecordFormat,
    on_render_error: RenderErrorPolicy,
}

impl ChunkSealer {
    pub fn new(format: RecordFormat, on_render_error: RenderErrorPolicy) -> Self {
        Self {
            format,
            on_render_error,
        }
    }

    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self::new(config.format, config.on_render_error)
    }

    /// Seal `records`, which must be non-empty, contiguous and belong to one
    /// partition. `byte_offset` is where the chunk will start inside its
    /// payload object.
    pub fn seal(&self, records: &[SinkRecord], byte_offset: u64) -> Result<SealedChunk> {
        let first = records.first().ok_or_else(|| {
            ArchiveError::RuntimeError("cannot seal an empty record list".to_string())
        })?;

        let mut lines = Vec::with_capacity(records.iter().map(|r| self.format.line_len(r)).sum());
        let mut skipped = 0u64;

        for record in records {
            let start = lines.len();
            match self.render(record, &mut lines) {
                Ok(()) => {}
                Err(reason) => match self.on_render_error {
                    RenderErrorPolicy::Fail => {
                        return Err(ArchiveError::RenderError {
                            offset: record.offset,
                            reason,
                        });
                    }
                    RenderErrorPolicy::Skip => {
                        lines.truncate(start);
                        skipped += 1;
                        metrics::RENDER_FAILURES_TOTAL
                            .with_label_values(&[record.topic.as_str()])
                            .inc();
                        tracing::warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            reason = %reason,
                            "skipping unrenderable record"
                        );
                    }
                },
            }
        }

        let member = codec::encode_member(&lines)?;
        let chunk = Chunk {
            byte_length_uncompressed: lines.len() as u64,
            num_records: records.len() as u64,
            byte_length: member.len() as u64,
            byte_offset,
            first_record_offset: first.offset,
        };

        Ok(SealedChunk {
            chunk,
            payload: Bytes::from(member),
            skipped,
            first_timestamp: first.timestamp,
        })
    }

    fn render(&self, record: &SinkRecord, out: &mut Vec<u8>) -> std::result::Result<(), String> {
        match self.format {
            RecordFormat::Value => {
                let text = std::str::from_utf8(&record.value)
                    .map_err(|e| format!("value is not valid UTF-8: {}", e))?;
                if text.contains('\n') {
                    return Err("value contains a newline".to_string());
                }
                out.extend_from_slice(text.as_bytes());
            }
            RecordFormat::Json => {
                let key = record
                    .key
                    .as_ref()
                    .map(|k| std::str::from_utf8(k).map(str::to_string))
                    .transpose()
                    .map_err(|e| format!("key is not valid UTF-8: {}", e))?;
                let value = std::str::from_utf8(&record.value)
                    .map_err(|e| format!("value is not valid UTF-8: {}", e))?;
                let doc = serde_json::json!({
                    "topic": record.topic,
                    "partition": record.partition,
                    "offset": record.offset,
                    "timestamp": record.timestamp,
                    "key": key,
                    "value": value,
                });
                serde_json::to_writer(&mut *out, &doc)
                    .map_err(|e| format!("JSON write error: {}", e))?;
            }
        }
        out.push(b'\n');
        Ok(())
    }
}

/// Braces, commas, the six quoted field names with their colons, and the
/// trailing newline of a `json` line.
const JSON_ENVELOPE_LEN: usize = 63;

impl RecordFormat {
    /// Length of `record` rendered as one archive line, newline included.
    /// Exact for renderable records; unrenderable ones are sized from their
    /// raw bytes.
    pub fn line_len(&self, record: &SinkRecord) -> usize {
        match self {
            RecordFormat::Value => record.estimated_line_len(),
            RecordFormat::Json => {
                JSON_ENVELOPE_LEN
                    + json_string_len(record.topic.as_bytes())
                    + decimal_len(u64::from(record.partition))
                    + decimal_len(record.offset)
                    + decimal_len(record.timestamp)
                    + record.key.as_ref().map_or(4, |k| json_string_len(k))
                    + json_string_len(&record.value)
            }
        }
    }
}

/// Length of `s` as a quoted JSON string, escapes included.
fn json_string_len(s: &[u8]) -> usize {
    2 + s
        .iter()
        .map(|&b| match b {
            b'"' | b'\\' | b'\n' | b'\r' | b'\t' | 0x08 | 0x0c => 2,
            0x00..=0x1f => 6,
            _ => 1,
        })
        .sum::<usize>()
}

fn decimal_len(n: u64) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

/// Sealed chunks that share one payload object.
#[derive(Debug, Clone)]
pub struct ChunkGroup {
    tp: TopicPartition,
    index: IndexFile,
    payload: BytesMut,
    first_timestamp: Option<u64>,
    skipped: u64,
}

impl ChunkGroup {
    pub fn new(tp: TopicPartition) -> Self {
        Self {
            tp,
            index: IndexFile::new(),
            payload: BytesMut::new(),
            first_timestamp: None,
            skipped: 0,
        }
    }

    /// Add a sealed chunk. Its `byte_offset` must equal
    /// [`next_byte_offset`](Self::next_byte_offset).
    pub fn push(&mut self, sealed: SealedChunk) -> Result<()> {
        self.index.push(sealed.chunk)?;
        self.payload.extend_from_slice(&sealed.payload);
        self.first_timestamp.get_or_insert(sealed.first_timestamp);
        self.skipped += sealed.skipped;
        Ok(())
    }

    /// Byte offset the next chunk of this group starts at.
    pub fn next_byte_offset(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn index(&self) -> &IndexFile {
        &self.index
    }

    /// The concatenated gzip members of all chunks.
    pub fn payload(&self) -> Bytes {
        self.payload.clone().freeze()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.index.first_offset()
    }

    pub fn next_offset(&self) -> Option<u64> {
        self.index.next_offset()
    }

    /// Timestamp of the group's first record, which dates its object keys.
    pub fn first_timestamp(&self) -> Option<u64> {
        self.first_timestamp
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
