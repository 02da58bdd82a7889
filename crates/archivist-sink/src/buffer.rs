//! Partition Buffer
//!
//! Accumulates the records of one partition between seals and decides when
//! the next seal is due. Any one of three thresholds triggers a seal:
//!
//! - **size**: rendered size of the buffered lines, in the configured
//!   format, reaches `max_bytes`
//! - **count**: the buffer holds `max_records` records
//! - **age**: the first buffered record was appended `max_age` ago
//!
//! The buffer also owns the partition's ordering check. Every appended offset
//! must equal the expected next offset, which is seeded from recovery or, on
//! a partition with no archive yet, taken from the first record seen.

use std::time::{Duration, Instant};

use archivist_core::{SinkRecord, TopicPartition};

use crate::config::{ArchiverConfig, RecordFormat};
use crate::error::{ArchiveError, Result};

/// Seal thresholds of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_bytes: usize,
    pub max_records: usize,
    pub max_age: Duration,
    /// Rendering the size threshold is measured in.
    pub format: RecordFormat,
}

impl BufferLimits {
    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            max_bytes: config.chunk_max_bytes,
            max_records: config.chunk_max_records,
            max_age: config.chunk_max_age(),
            format: config.format,
        }
    }
}

/// Which threshold asked for a seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealTrigger {
    Bytes,
    Records,
    Age,
}

impl SealTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealTrigger::Bytes => "bytes",
            SealTrigger::Records => "records",
            SealTrigger::Age => "age",
        }
    }
}

/// Open, unsealed records of one partition.
#[derive(Debug)]
pub struct PartitionBuffer {
    tp: TopicPartition,
    limits: BufferLimits,
    records: Vec<SinkRecord>,
    byte_size: usize,
    opened_at: Option<Instant>,
    expected_next_offset: Option<u64>,
    sealed_next_offset: Option<u64>,
}

impl PartitionBuffer {
    pub fn new(tp: TopicPartition, limits: BufferLimits) -> Self {
        Self {
            tp,
            limits,
            records: Vec::new(),
            byte_size: 0,
            opened_at: None,
            expected_next_offset: None,
            sealed_next_offset: None,
        }
    }

    /// Seed the ordering check, typically with a recovered resume offset.
    pub fn with_expected_offset(mut self, offset: Option<u64>) -> Self {
        self.expected_next_offset = offset;
        self.sealed_next_offset = offset;
        self
    }

    /// Append one record and report whether a seal is now due.
    pub fn append(&mut self, record: SinkRecord) -> Result<bool> {
        self.append_at(record, Instant::now())
    }

    /// Like [`append`](Self::append) with an explicit clock reading.
    pub fn append_at(&mut self, record: SinkRecord, now: Instant) -> Result<bool> {
        if let Some(expected) = self.expected_next_offset {
            if record.offset != expected {
                return Err(ArchiveError::OrderingViolation {
                    topic: self.tp.topic.clone(),
                    partition: self.tp.partition,
                    expected,
                    actual: record.offset,
                });
            }
        }

        self.expected_next_offset = Some(record.offset + 1);
        self.byte_size += self.limits.format.line_len(&record);
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.records.push(record);

        Ok(self.trigger_at(now).is_some())
    }

    /// The threshold that currently calls for a seal, if any. Size and count
    /// win over age when several are crossed at once.
    pub fn trigger_at(&self, now: Instant) -> Option<SealTrigger> {
        if self.records.is_empty() {
            return None;
        }
        if self.byte_size >= self.limits.max_bytes {
            Some(SealTrigger::Bytes)
        } else if self.records.len() >= self.limits.max_records {
            Some(SealTrigger::Records)
        } else if self.is_expired(now) {
            Some(SealTrigger::Age)
        } else {
            None
        }
    }

    /// Whether the buffer has been open for at least `max_age`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.opened_at
            .map(|opened| now.saturating_duration_since(opened) >= self.limits.max_age)
            .unwrap_or(false)
    }

    /// Hand the buffered records over for sealing and start a new buffer.
    pub fn take(&mut self) -> Vec<SinkRecord> {
        self.byte_size = 0;
        self.opened_at = None;
        self.sealed_next_offset = self.expected_next_offset;
        std::mem::take(&mut self.records)
    }

    /// Drop the unsealed tail. The ordering check falls back to the position
    /// after the last taken record, so the dropped range can be redelivered.
    pub fn discard(&mut self) -> usize {
        let dropped = self.records.len();
        self.records.clear();
        self.byte_size = 0;
        self.opened_at = None;
        self.expected_next_offset = self.sealed_next_offset;
        dropped
    }

    /// Reset the ordering check to `offset`. Only valid on an empty buffer.
    pub fn rewind(&mut self, offset: Option<u64>) {
        debug_assert!(self.records.is_empty());
        self.expected_next_offset = offset;
        self.sealed_next_offset = offset;
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn expected_next_offset(&self) -> Option<u64> {
        self.expected_next_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderErrorPolicy;
    use crate::sealer::ChunkSealer;
    use bytes::Bytes;

    fn limits(max_bytes: usize, max_records: usize, max_age_ms: u64) -> BufferLimits {
        BufferLimits {
            max_bytes,
            max_records,
            max_age: Duration::from_millis(max_age_ms),
            format: RecordFormat::Value,
        }
    }

    fn buffer(l: BufferLimits) -> PartitionBuffer {
        PartitionBuffer::new(TopicPartition::new("t", 0), l)
    }

    fn rec(offset: u64, value: &str) -> SinkRecord {
        SinkRecord::new("t", 0, offset, 1_700_000_000_000, None, Bytes::from(value.to_string()))
    }

    // ---------------------------------------------------------------
    // Ordering
    // ---------------------------------------------------------------

    #[test]
    fn test_first_record_sets_base_offset() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        assert_eq!(buf.expected_next_offset(), None);
        buf.append(rec(200, "a")).unwrap();
        assert_eq!(buf.first_offset(), Some(200));
        assert_eq!(buf.expected_next_offset(), Some(201));
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        buf.append(rec(0, "a")).unwrap();
        let err = buf.append(rec(2, "c")).unwrap_err();
        match err {
            ArchiveError::OrderingViolation { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Rejected record leaves the buffer untouched
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_regression_is_rejected() {
        let mut buf = buffer(limits(1024, 100, 60_000)).with_expected_offset(Some(33));
        assert!(buf.append(rec(32, "x")).is_err());
        assert!(buf.append(rec(33, "x")).is_ok());
    }

    #[test]
    fn test_recovered_offset_enforced_on_first_append() {
        let mut buf = buffer(limits(1024, 100, 60_000)).with_expected_offset(Some(33));
        assert!(buf.append(rec(0, "x")).is_err());
    }

    // ---------------------------------------------------------------
    // Thresholds
    // ---------------------------------------------------------------

    #[test]
    fn test_record_count_threshold() {
        let mut buf = buffer(limits(1024 * 1024, 3, 60_000));
        assert!(!buf.append(rec(0, "a")).unwrap());
        assert!(!buf.append(rec(1, "b")).unwrap());
        assert!(buf.append(rec(2, "c")).unwrap());
        assert_eq!(buf.trigger_at(Instant::now()), Some(SealTrigger::Records));
    }

    #[test]
    fn test_byte_threshold_counts_newlines() {
        // Each record is 4 bytes rendered ("abc\n")
        let mut buf = buffer(limits(8, 100, 60_000));
        assert!(!buf.append(rec(0, "abc")).unwrap());
        assert_eq!(buf.byte_size(), 4);
        assert!(buf.append(rec(1, "abc")).unwrap());
        assert_eq!(buf.trigger_at(Instant::now()), Some(SealTrigger::Bytes));
    }

    #[test]
    fn test_byte_threshold_in_json_format() {
        let limits = BufferLimits {
            format: RecordFormat::Json,
            ..limits(1000, 1_000_000, 60_000)
        };
        let mut buf = buffer(limits);
        let mut offset = 0;
        while !buf.append(rec(offset, "v")).unwrap() {
            offset += 1;
        }
        assert_eq!(buf.trigger_at(Instant::now()), Some(SealTrigger::Bytes));

        let buffered = buf.byte_size();
        let records = buf.take();
        let line = RecordFormat::Json.line_len(&records[0]);
        assert!(buffered >= 1000 && buffered < 1000 + line);

        let sealed = ChunkSealer::new(RecordFormat::Json, RenderErrorPolicy::Fail)
            .seal(&records, 0)
            .unwrap();
        assert_eq!(sealed.chunk.byte_length_uncompressed as usize, buffered);
    }

    #[test]
    fn test_age_threshold() {
        let mut buf = buffer(limits(1024, 100, 500));
        let t0 = Instant::now();
        assert!(!buf.append_at(rec(0, "a"), t0).unwrap());
        assert!(!buf.is_expired(t0 + Duration::from_millis(499)));
        assert!(buf.is_expired(t0 + Duration::from_millis(500)));
        assert_eq!(
            buf.trigger_at(t0 + Duration::from_millis(501)),
            Some(SealTrigger::Age)
        );
        // Age is measured from the first record, not the latest
        assert!(buf
            .append_at(rec(1, "b"), t0 + Duration::from_millis(600))
            .unwrap());
    }

    #[test]
    fn test_empty_buffer_never_triggers() {
        let buf = buffer(limits(1, 1, 0));
        assert!(!buf.is_expired(Instant::now()));
        assert_eq!(buf.trigger_at(Instant::now()), None);
    }

    // ---------------------------------------------------------------
    // Take / discard
    // ---------------------------------------------------------------

    #[test]
    fn test_take_resets_buffer() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        buf.append(rec(0, "a")).unwrap();
        buf.append(rec(1, "b")).unwrap();
        let taken = buf.take();
        assert_eq!(taken.len(), 2);
        assert!(buf.is_empty());
        assert_eq!(buf.byte_size(), 0);
        assert_eq!(buf.first_offset(), None);
        assert_eq!(buf.expected_next_offset(), Some(2));
        assert!(!buf.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_discard_rewinds_to_last_take() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        buf.append(rec(0, "a")).unwrap();
        buf.take();
        buf.append(rec(1, "b")).unwrap();
        buf.append(rec(2, "c")).unwrap();
        assert_eq!(buf.discard(), 2);
        assert_eq!(buf.expected_next_offset(), Some(1));
        // Redelivery of the dropped range is accepted
        assert!(buf.append(rec(1, "b")).is_ok());
    }

    #[test]
    fn test_discard_before_any_take_forgets_base() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        buf.append(rec(10, "a")).unwrap();
        buf.discard();
        assert_eq!(buf.expected_next_offset(), None);
    }

    #[test]
    fn test_rewind() {
        let mut buf = buffer(limits(1024, 100, 60_000));
        buf.append(rec(0, "a")).unwrap();
        buf.take();
        buf.rewind(Some(0));
        assert!(buf.append(rec(0, "a")).is_ok());
    }
}
