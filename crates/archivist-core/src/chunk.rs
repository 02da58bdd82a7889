//! Chunk and Index Descriptors
//!
//! A **chunk** is an immutable, offset-bounded, gzip-compressed slice of one
//! partition's record stream. One or more chunks share a payload object (a
//! *group*); the group's **index file** lists their descriptors in offset
//! order.
//!
//! ## Index Invariants
//!
//! For consecutive descriptors `a` and `b` in one index:
//!
//! ```text
//! b.first_record_offset == a.first_record_offset + a.num_records
//! b.byte_offset         == a.byte_offset         + a.byte_length
//! ```
//!
//! and the first descriptor starts at `byte_offset == 0`.
//!
//! ## Wire Format
//!
//! The index is stored as compact JSON with a fixed field order:
//!
//! ```text
//! {"chunks":[{"byte_length_uncompressed":990,"num_records":33,"byte_length":137,"byte_offset":0,"first_record_offset":0}]}
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{Error, Result};

/// Descriptor of one sealed chunk inside a payload object.
///
/// Field declaration order is the JSON field order and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Size of the rendered lines before compression.
    pub byte_length_uncompressed: u64,
    /// Number of upstream offsets covered by this chunk.
    pub num_records: u64,
    /// Size of the chunk's gzip member.
    pub byte_length: u64,
    /// Position of the chunk's gzip member within the payload object.
    pub byte_offset: u64,
    /// Upstream offset of the first record.
    pub first_record_offset: u64,
}

impl Chunk {
    /// Offset of the record that follows this chunk. Only meaningful for a
    /// chunk that passed [`IndexFile::validate`].
    pub fn next_offset(&self) -> u64 {
        self.first_record_offset + self.num_records
    }

    /// Byte range of this chunk's gzip member within its payload object.
    pub fn byte_range(&self) -> Range<u64> {
        self.byte_offset..self.byte_offset + self.byte_length
    }

    /// Like [`next_offset`](Self::next_offset), `None` on overflow.
    pub fn checked_next_offset(&self) -> Option<u64> {
        self.first_record_offset.checked_add(self.num_records)
    }

    /// End of the chunk's byte range, `None` on overflow.
    pub fn checked_end_byte(&self) -> Option<u64> {
        self.byte_offset.checked_add(self.byte_length)
    }

    /// Whether `offset` falls inside this chunk's offset range.
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.first_record_offset
            && self.checked_next_offset().map_or(true, |end| offset < end)
    }
}

/// Ordered list of chunk descriptors sharing one payload object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFile {
    pub chunks: Vec<Chunk>,
}

impl IndexFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor, enforcing contiguity with the previous one.
    pub fn push(&mut self, chunk: Chunk) -> Result<()> {
        check_bounds(&chunk)?;
        match self.chunks.last() {
            Some(last) => check_successor(last, &chunk)?,
            None if chunk.byte_offset != 0 => {
                return Err(Error::InvalidIndex(format!(
                    "first chunk must start at byte 0, got {}",
                    chunk.byte_offset
                )));
            }
            None => {}
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Check the index invariants. An index without chunks is invalid.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| Error::InvalidIndex("index has no chunks".to_string()))?;
        if first.byte_offset != 0 {
            return Err(Error::InvalidIndex(format!(
                "first chunk must start at byte 0, got {}",
                first.byte_offset
            )));
        }
        for chunk in &self.chunks {
            check_bounds(chunk)?;
        }
        for pair in self.chunks.windows(2) {
            check_successor(&pair[0], &pair[1])?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn first(&self) -> Option<&Chunk> {
        self.chunks.first()
    }

    pub fn last(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    /// Offset of the first record of the group.
    pub fn first_offset(&self) -> Option<u64> {
        self.first().map(|c| c.first_record_offset)
    }

    /// Offset that follows the last chunk: where a restarted pipeline resumes.
    pub fn next_offset(&self) -> Option<u64> {
        self.last().map(Chunk::next_offset)
    }

    /// Total compressed size of the payload object described by this index.
    pub fn payload_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.byte_length).sum()
    }

    /// Total decompressed size of the payload object.
    pub fn uncompressed_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.byte_length_uncompressed).sum()
    }

    pub fn total_records(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_records).sum()
    }

    /// The chunk covering `offset`, if any.
    pub fn chunk_for_offset(&self, offset: u64) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.contains_offset(offset))
    }

    /// Serialize to the compact JSON wire format.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate the JSON wire format.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let index: IndexFile = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidIndex(format!("malformed index JSON: {}", e)))?;
        index.validate()?;
        Ok(index)
    }
}

/// Offset and byte ranges must be representable.
fn check_bounds(chunk: &Chunk) -> Result<()> {
    if chunk.checked_next_offset().is_none() {
        return Err(Error::InvalidIndex(format!(
            "chunk at offset {} with {} records overflows the offset range",
            chunk.first_record_offset, chunk.num_records
        )));
    }
    if chunk.checked_end_byte().is_none() {
        return Err(Error::InvalidIndex(format!(
            "chunk at byte {} with length {} overflows the byte range",
            chunk.byte_offset, chunk.byte_length
        )));
    }
    Ok(())
}

fn check_successor(prev: &Chunk, next: &Chunk) -> Result<()> {
    let prev_end = prev.checked_next_offset();
    if Some(next.first_record_offset) != prev_end {
        return Err(Error::InvalidIndex(format!(
            "chunk at offset {} does not follow chunk ending at {:?}",
            next.first_record_offset, prev_end
        )));
    }
    let prev_end_byte = prev.checked_end_byte();
    if Some(next.byte_offset) != prev_end_byte {
        return Err(Error::InvalidIndex(format!(
            "chunk at byte {} does not follow chunk ending at byte {:?}",
            next.byte_offset, prev_end_byte
        )));
    }
    Ok(())
}
