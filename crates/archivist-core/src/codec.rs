//! Chunk Payload Codec
//!
//! Each chunk is compressed as one self-contained gzip member. A payload
//! object holding several chunks is the plain concatenation of their members,
//! which any multi-member gzip reader (`zcat`, `MultiGzDecoder`) decodes as a
//! single stream.
//!
//! Encoding is deterministic: the header carries `mtime = 0` and neither a
//! file name nor a comment, so the same input always yields the same bytes.
//! Retried uploads depend on this to overwrite objects with identical content.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, MultiGzDecoder};
use flate2::{Compression, GzBuilder};

use crate::error::{Error, Result};

/// Compress `data` as a single gzip member with a reproducible header.
pub fn encode_member(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(data.len() / 4 + 32), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(e.to_string()))
}

/// Decompress exactly one gzip member, such as a chunk's byte range.
pub fn decode_member(member: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(member)
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(out)
}

/// Decompress a whole payload object made of concatenated members.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(out)
}
