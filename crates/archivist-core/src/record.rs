//! Record Data Structures
//!
//! This module defines the unit of data handed to the archiver by the
//! upstream transport, and the `(topic, partition)` pair that scopes every
//! piece of archive state.
//!
//! ## SinkRecord
//! Each record carries:
//! - **topic** / **partition**: where the record was consumed from
//! - **offset**: position within the partition, assigned upstream
//! - **timestamp**: milliseconds since epoch; the first record of a group
//!   decides the date segment of the group's object keys
//! - **key**: optional upstream key (not archived in `value` format)
//! - **value**: the payload that gets rendered into the archive
//!
//! ## Example
//! ```ignore
//! let record = SinkRecord::new(
//!     "events",                          // topic
//!     0,                                 // partition
//!     42,                                // offset
//!     1_700_000_000_000,                 // timestamp
//!     None,                              // key
//!     Bytes::from(r#"{"action":"click"}"#),
//! );
//! ```

use bytes::Bytes;
use std::fmt;

/// A record consumed from one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Topic the record was consumed from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Timestamp in milliseconds since epoch.
    pub timestamp: u64,
    /// Optional record key.
    pub key: Option<Bytes>,
    /// Record value (payload).
    pub value: Bytes,
}

impl SinkRecord {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: u64,
        timestamp: u64,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp,
            key,
            value,
        }
    }

    /// The partition this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Size of the record rendered as a raw-value archive line (value plus
    /// newline terminator). Other renderings carry more bytes per line.
    pub fn estimated_line_len(&self) -> usize {
        self.value.len() + 1
    }
}

/// A `(topic, partition)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
