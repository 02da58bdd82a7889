//! Edge cases of the archive data model: index parsing, key parsing and
//! multi-member payloads built the way the pipeline builds them.

use archivist_core::codec::{decode_member, decode_payload, encode_member};
use archivist_core::{Chunk, IndexFile, ObjectKeys, TopicPartition};

fn lines(first: u64, n: u64) -> Vec<u8> {
    (first..first + n)
        .flat_map(|c| format!("{{\"foo\": \"bar\", \"counter\":{}}}\n", 200 + c).into_bytes())
        .collect()
}

/// Compress `sizes` consecutive chunks into one payload and its index.
fn group(sizes: &[u64]) -> (Vec<u8>, IndexFile) {
    let mut payload = Vec::new();
    let mut index = IndexFile::new();
    let mut offset = 0;
    for &n in sizes {
        let data = lines(offset, n);
        let member = encode_member(&data).unwrap();
        index
            .push(Chunk {
                byte_length_uncompressed: data.len() as u64,
                num_records: n,
                byte_length: member.len() as u64,
                byte_offset: payload.len() as u64,
                first_record_offset: offset,
            })
            .unwrap();
        payload.extend_from_slice(&member);
        offset += n;
    }
    (payload, index)
}

// ============================================================================
// Multi-member payloads
// ============================================================================

#[test]
fn test_each_chunk_decodes_from_its_range() {
    let (payload, index) = group(&[33, 1, 20]);
    assert_eq!(index.payload_len(), payload.len() as u64);

    for chunk in &index.chunks {
        let range = chunk.byte_range();
        let data = decode_member(&payload[range.start as usize..range.end as usize]).unwrap();
        assert_eq!(data, lines(chunk.first_record_offset, chunk.num_records));
    }
}

#[test]
fn test_whole_payload_decodes_as_one_stream() {
    let (payload, index) = group(&[10, 10, 10]);
    let data = decode_payload(&payload).unwrap();
    assert_eq!(data.len() as u64, index.uncompressed_len());
    assert_eq!(data, lines(0, 30));
}

#[test]
fn test_truncated_member_fails_to_decode() {
    let (payload, index) = group(&[5]);
    let cut = index.chunks[0].byte_length as usize - 4;
    assert!(decode_member(&payload[..cut]).is_err());
}

// ============================================================================
// Index parsing
// ============================================================================

#[test]
fn test_json_roundtrip_preserves_layout() {
    let (_, index) = group(&[33, 34]);
    let json = index.to_json().unwrap();
    assert_eq!(IndexFile::from_json(&json).unwrap(), index);
    assert!(json.starts_with(b"{\"chunks\":[{\"byte_length_uncompressed\":990,\"num_records\":33,"));
}

#[test]
fn test_rejects_empty_index() {
    assert!(IndexFile::from_json(br#"{"chunks":[]}"#).is_err());
}

#[test]
fn test_rejects_gap_between_chunks() {
    let json = br#"{"chunks":[
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":0,"first_record_offset":0},
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":20,"first_record_offset":2}
    ]}"#;
    assert!(IndexFile::from_json(json).is_err());
}

#[test]
fn test_rejects_overlapping_bytes() {
    let json = br#"{"chunks":[
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":0,"first_record_offset":0},
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":10,"first_record_offset":1}
    ]}"#;
    assert!(IndexFile::from_json(json).is_err());
}

#[test]
fn test_rejects_missing_field() {
    let json = br#"{"chunks":[{"num_records":1,"byte_length":20,"byte_offset":0,"first_record_offset":0}]}"#;
    assert!(IndexFile::from_json(json).is_err());
}

#[test]
fn test_rejects_offset_overflow_without_panicking() {
    let json = br#"{"chunks":[
        {"byte_length_uncompressed":30,"num_records":2,"byte_length":20,"byte_offset":0,"first_record_offset":18446744073709551615},
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":20,"first_record_offset":1}
    ]}"#;
    let err = IndexFile::from_json(json).unwrap_err();
    assert!(err.to_string().contains("overflows"), "unexpected error: {}", err);
}

#[test]
fn test_rejects_byte_range_overflow_without_panicking() {
    let json = br#"{"chunks":[
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":18446744073709551615,"byte_offset":0,"first_record_offset":0},
        {"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":18446744073709551615,"first_record_offset":1}
    ]}"#;
    assert!(IndexFile::from_json(json).is_err());
}

#[test]
fn test_offset_range_ending_at_u64_max() {
    let json = br#"{"chunks":[{"byte_length_uncompressed":30,"num_records":1,"byte_length":20,"byte_offset":0,"first_record_offset":18446744073709551614}]}"#;
    let index = IndexFile::from_json(json).unwrap();
    assert_eq!(index.next_offset(), Some(u64::MAX));
}

// ============================================================================
// Key parsing
// ============================================================================

#[test]
fn test_index_key_offsets_round_trip_through_keys() {
    let keys = ObjectKeys::new("systest/");
    let tp = TopicPartition::new("my-topic", 12);
    let key = keys.index_key(&tp, 987_654_321, 1_700_000_000_000).unwrap();
    assert_eq!(key, "systest/2023-11-14/my-topic-00012-000987654321.index.json");
    assert_eq!(ObjectKeys::first_offset_of_index(&tp, &key), Some(987_654_321));
    assert_eq!(
        ObjectKeys::payload_key_for_index(&key).unwrap(),
        "systest/2023-11-14/my-topic-00012-000987654321.gz"
    );
}

#[test]
fn test_key_of_other_partition_is_ignored() {
    let keys = ObjectKeys::new("systest");
    let key = keys
        .index_key(&TopicPartition::new("t", 1), 0, 1_700_000_000_000)
        .unwrap();
    assert_eq!(ObjectKeys::first_offset_of_index(&TopicPartition::new("t", 10), &key), None);
    assert_eq!(ObjectKeys::first_offset_of_index(&TopicPartition::new("t", 0), &key), None);
}

#[test]
fn test_payload_and_pointer_keys_are_not_indexes() {
    let keys = ObjectKeys::new("systest");
    let tp = TopicPartition::new("t", 0);
    let payload = keys.payload_key(&tp, 0, 1_700_000_000_000).unwrap();
    assert_eq!(ObjectKeys::first_offset_of_index(&tp, &payload), None);
    assert_eq!(ObjectKeys::first_offset_of_index(&tp, &keys.pointer_key(&tp)), None);
    assert!(ObjectKeys::payload_key_for_index(&payload).is_err());
}

#[test]
fn test_offsets_wider_than_padding() {
    let keys = ObjectKeys::new("");
    let tp = TopicPartition::new("t", 0);
    let key = keys.index_key(&tp, 1_234_567_890_123, 0).unwrap();
    assert_eq!(key, "1970-01-01/t-00000-1234567890123.index.json");
    assert_eq!(ObjectKeys::first_offset_of_index(&tp, &key), Some(1_234_567_890_123));
}
