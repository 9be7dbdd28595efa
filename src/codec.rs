//! # Record and Payload Encoding
//!
//! Everything the engine persists goes through this module.
//!
//! ## Formats
//!
//! | What | Stored as |
//! |------|-----------|
//! | Change records, hints, entities | JSON (`serde_json`) |
//! | Out-of-line values | `Zstd(JSON(value))`, xxh3-64 checksum kept in the reference |
//! | Saved event lists | JSON inside the change record, xxh3-64 over the encoded list |
//!
//! JSON keeps records readable from the `sqlite3` shell; the only payloads
//! that can get large (values) are compressed.
//!
//! ## Integrity
//!
//! A roll-forward worker replays events written by someone else. The event
//! checksum lets it refuse a record that was damaged in between, and the
//! value checksum does the same for out-of-line payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::types::Value;

/// Zstd level for value payloads. Level 1 favors speed.
const ZSTD_LEVEL: i32 = 1;

// =============================================================================
// Records
// =============================================================================

/// Encodes a record as JSON.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decodes a JSON record.
pub fn decode_record<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// XXH3-64 over raw bytes.
pub fn checksum(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Checksum of an event list as it is persisted.
pub fn events_checksum(events: &[Event]) -> Result<u64> {
    Ok(checksum(&encode_record(&events)?))
}

// =============================================================================
// Value Payloads
// =============================================================================

/// A value encoded for out-of-line storage.
#[derive(Debug, Clone)]
pub struct EncodedValue {
    /// Compressed payload.
    pub bytes: Vec<u8>,
    /// Checksum of `bytes`.
    pub checksum: u64,
}

/// Size of a value when stored inline.
pub fn inline_size(value: &Value) -> Result<usize> {
    Ok(serde_json::to_vec(value)?.len())
}

/// Compresses a value for out-of-line storage.
pub fn encode_value_payload(value: &Value) -> Result<EncodedValue> {
    let json = serde_json::to_vec(value)?;
    let bytes = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;
    let checksum = checksum(&bytes);
    Ok(EncodedValue { bytes, checksum })
}

/// Verifies and decompresses an out-of-line value.
pub fn decode_value_payload(bytes: &[u8], expected_checksum: u64) -> Result<Value> {
    let actual = checksum(bytes);
    if actual != expected_checksum {
        return Err(Error::Corrupted(format!(
            "value payload checksum mismatch: expected {expected_checksum:016x}, got {actual:016x}"
        )));
    }
    let json = zstd::decode_all(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}
