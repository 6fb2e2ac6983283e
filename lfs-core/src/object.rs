//! Object identifiers
//!
//! Every LFS object and every lock is keyed by a SHA-256 digest rendered as
//! 64 lower-case hex characters.

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::str::FromStr;

/// Errors produced when parsing an object id from the wire
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectIdError {
    #[error("invalid object id length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in object id")]
    InvalidHex,
}

/// SHA-256 digest identifying an object (or a lock, for path hashes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Finish an incremental hash into an ObjectId
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    ///
    /// Only the canonical 64-character form is accepted, so an id taken from
    /// a client can always be used as a file name.
    pub fn from_hex(hex_str: &str) -> Result<Self, ObjectIdError> {
        if hex_str.len() != 64 {
            return Err(ObjectIdError::InvalidLength(hex_str.len()));
        }
        let mut arr = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut arr).map_err(|_| ObjectIdError::InvalidHex)?;
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Relative location below a sharded directory: `ab/cd/abcd...`
    pub fn shard_path(&self) -> PathBuf {
        let hex = self.to_hex();
        PathBuf::from(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
