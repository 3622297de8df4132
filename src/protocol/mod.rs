//! Protocol module
//!
//! All messages crossing a socket or the disk are Protocol Buffer types,
//! hand-derived with prost (no build-time codegen). This module provides
//! the message definitions, serialization helpers with a size cap, and
//! conversions between wire addresses and the std/ipnet types used
//! internally.

pub mod net;
mod wire;

use crate::error::ProtocolError;
use prost::Message;

pub use wire::*;

/// Maximum serialized message size (4 MB)
///
/// A full KvStore dump of a large domain fits comfortably; anything bigger
/// is a bug or an attack.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Serialize a Protocol Buffer message to bytes
///
/// # Errors
///
/// Returns `ProtocolError::MessageTooLarge` if the encoded form exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn serialize_message<T: Message>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .map_err(|e| ProtocolError::SerializationFailed {
            message_type: std::any::type_name::<T>().to_string(),
            reason: e.to_string(),
        })?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(buf)
}

/// Deserialize bytes into a Protocol Buffer message
pub fn deserialize_message<T: Message + Default>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    T::decode(bytes).map_err(|e| ProtocolError::DeserializationFailed {
        reason: e.to_string(),
    })
}

/// Deterministic hash over (version, originator_id, value)
///
/// Stored in [`Value::hash`] and compared across nodes, so it must be
/// stable across platforms and releases; blake3 truncated to the low 63
/// bits (kept non-negative so "unset" sentinels stay unambiguous).
pub fn hash_value(version: u64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&version.to_be_bytes());
    hasher.update(originator_id.as_bytes());
    if let Some(body) = value {
        hasher.update(body);
    }
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(first) & 0x7fff_ffff_ffff_ffff) as i64
}

impl Value {
    /// Build a value with its hash filled in
    pub fn new(version: u64, originator_id: impl Into<String>, value: Vec<u8>, ttl: i64) -> Self {
        let originator_id = originator_id.into();
        let hash = hash_value(version, &originator_id, Some(&value));
        Self {
            version,
            originator_id,
            value: Some(value),
            ttl,
            ttl_version: 0,
            hash: Some(hash),
        }
    }

    /// Recompute and store the hash from the current fields
    pub fn update_hash(&mut self) {
        self.hash = Some(hash_value(
            self.version,
            &self.originator_id,
            self.value.as_deref(),
        ));
    }

    /// A copy carrying only the hash (body stripped), as used in hash dumps
    pub fn hash_only(&self) -> Self {
        Self {
            version: self.version,
            originator_id: self.originator_id.clone(),
            value: None,
            ttl: self.ttl,
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }
}
