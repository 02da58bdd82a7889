//! Object Naming
//!
//! Every object the archiver writes has a key that is a pure function of the
//! prefix, the topic, the partition, the first record offset of the group and
//! the UTC date of the group's first record. Wall-clock time never enters a
//! key, so re-publishing the same offset range always lands on the same keys.
//!
//! ## Layout
//!
//! ```text
//! <prefix>/<YYYY-MM-dd>/<topic>-<ppppp>-<oooooooooooo>.gz           payload
//! <prefix>/<YYYY-MM-dd>/<topic>-<ppppp>-<oooooooooooo>.index.json   index
//! <prefix>/last_chunk_index.<topic>-<ppppp>.txt                     pointer
//! ```
//!
//! `ppppp` is the partition zero-padded to 5 digits, `oooooooooooo` the first
//! record offset zero-padded to 12 digits. The pointer's content is the full
//! index key, without a trailing newline.

use chrono::{TimeZone, Utc};

use crate::error::{Error, Result};
use crate::record::TopicPartition;

const PAYLOAD_SUFFIX: &str = ".gz";
const INDEX_SUFFIX: &str = ".index.json";
const POINTER_PREFIX: &str = "last_chunk_index.";
const POINTER_SUFFIX: &str = ".txt";

/// Builds the keys of payload, index and pointer objects under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKeys {
    prefix: String,
}

impl ObjectKeys {
    /// Create a key builder. Leading and trailing `/` on the prefix are ignored;
    /// an empty prefix puts objects at the root of the store.
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `YYYY-MM-dd` of a millisecond timestamp, in UTC.
    pub fn date_segment(timestamp_ms: u64) -> Result<String> {
        let millis = i64::try_from(timestamp_ms).map_err(|_| Error::InvalidTimestamp(timestamp_ms))?;
        let dt = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(Error::InvalidTimestamp(timestamp_ms))?;
        Ok(dt.format("%Y-%m-%d").to_string())
    }

    /// `<topic>-<ppppp>`, shared by every object of a partition.
    pub fn partition_stem(tp: &TopicPartition) -> String {
        format!("{}-{:05}", tp.topic, tp.partition)
    }

    /// `<topic>-<ppppp>-<oooooooooooo>`, the file stem of a group.
    pub fn group_stem(tp: &TopicPartition, first_offset: u64) -> String {
        format!("{}-{:012}", Self::partition_stem(tp), first_offset)
    }

    pub fn payload_key(&self, tp: &TopicPartition, first_offset: u64, first_timestamp: u64) -> Result<String> {
        let date = Self::date_segment(first_timestamp)?;
        Ok(self.join(&format!("{}/{}{}", date, Self::group_stem(tp, first_offset), PAYLOAD_SUFFIX)))
    }

    pub fn index_key(&self, tp: &TopicPartition, first_offset: u64, first_timestamp: u64) -> Result<String> {
        let date = Self::date_segment(first_timestamp)?;
        Ok(self.join(&format!("{}/{}{}", date, Self::group_stem(tp, first_offset), INDEX_SUFFIX)))
    }

    pub fn pointer_key(&self, tp: &TopicPartition) -> String {
        self.join(&format!(
            "{}{}{}",
            POINTER_PREFIX,
            Self::partition_stem(tp),
            POINTER_SUFFIX
        ))
    }

    /// Key of the payload object an index key describes.
    pub fn payload_key_for_index(index_key: &str) -> Result<String> {
        index_key
            .strip_suffix(INDEX_SUFFIX)
            .map(|stem| format!("{}{}", stem, PAYLOAD_SUFFIX))
            .ok_or_else(|| Error::InvalidKey(format!("not an index key: '{}'", index_key)))
    }

    /// First record offset encoded in an index key of partition `tp`, or
    /// `None` when the key belongs to another partition or is not an index.
    pub fn first_offset_of_index(tp: &TopicPartition, index_key: &str) -> Option<u64> {
        let file_name = index_key.rsplit('/').next()?;
        let stem = file_name.strip_suffix(INDEX_SUFFIX)?;
        let digits = stem
            .strip_prefix(&Self::partition_stem(tp))?
            .strip_prefix('-')?;
        if digits.len() < 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }
}
