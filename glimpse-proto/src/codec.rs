//! Binary encoding for durable snapshots.
//!
//! Snapshots (cache entries, the outbox, the viewed set) are encoded with
//! postcard behind a small header so that a format change is detected on
//! restore instead of producing garbage.
//!
//! Wire format: `[magic u8 = 0x47][version u8][postcard payload]`

use serde::Serialize;
use serde::de::DeserializeOwned;

/// First byte of every snapshot.
const SNAPSHOT_MAGIC: u8 = 0x47;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The snapshot header is missing or not ours.
    #[error("invalid snapshot header: {0}")]
    InvalidHeader(String),
    /// The snapshot was written by a different format version.
    #[error("snapshot version {found} does not match expected {expected}")]
    VersionMismatch {
        /// Version the reader understands.
        expected: u8,
        /// Version found in the header.
        found: u8,
    },
}

/// Encodes a value with postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from postcard bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a value as a versioned snapshot.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode_snapshot<T: Serialize>(version: u8, value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = encode(value)?;
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(SNAPSHOT_MAGIC);
    out.push(version);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a versioned snapshot written by [`encode_snapshot`].
///
/// # Errors
///
/// Returns `CodecError::InvalidHeader` if the header is missing,
/// `CodecError::VersionMismatch` if the version differs, or
/// `CodecError::Serialization` if the payload cannot be deserialized.
pub fn decode_snapshot<T: DeserializeOwned>(expected: u8, bytes: &[u8]) -> Result<T, CodecError> {
    let [magic, found, payload @ ..] = bytes else {
        return Err(CodecError::InvalidHeader(format!(
            "need at least 2 bytes, got {}",
            bytes.len()
        )));
    };
    if *magic != SNAPSHOT_MAGIC {
        return Err(CodecError::InvalidHeader(format!(
            "unexpected magic byte {magic:#04x}"
        )));
    }
    if *found != expected {
        return Err(CodecError::VersionMismatch {
            expected,
            found: *found,
        });
    }
    decode(payload)
}
