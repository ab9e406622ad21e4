//! Content ids and base-32 text encoding.
//!
//! Ids travel as unpadded RFC 4648 base-32 (52 characters for a 32-byte
//! root). Decoding accepts either letter case.

use crate::error::ContentIdError;
use crate::tree_hash::LeafHash;
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Encode bytes as unpadded upper-case base-32
#[must_use]
pub fn encode_base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}

/// Decode unpadded base-32 in either case
///
/// # Errors
///
/// Returns [`ContentIdError::InvalidEncoding`] for malformed input.
pub fn decode_base32(text: &str) -> Result<Vec<u8>, ContentIdError> {
    BASE32_NOPAD
        .decode(text.trim().to_ascii_uppercase().as_bytes())
        .map_err(|e| ContentIdError::InvalidEncoding(e.to_string()))
}

/// Root hash of a file's tree, identifying its content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(LeafHash);

impl ContentId {
    /// Wrap a root hash
    #[must_use]
    pub const fn from_bytes(bytes: LeafHash) -> Self {
        Self(bytes)
    }

    /// Get the raw root hash
    #[must_use]
    pub const fn as_bytes(&self) -> &LeafHash {
        &self.0
    }

    /// Parse from base-32 text
    ///
    /// # Errors
    ///
    /// Returns an error for malformed text or a value that is not 32 bytes.
    pub fn from_base32(text: &str) -> Result<Self, ContentIdError> {
        let bytes = decode_base32(text)?;
        let actual = bytes.len();
        let root: LeafHash = bytes
            .try_into()
            .map_err(|_| ContentIdError::InvalidLength {
                expected: 32,
                actual,
            })?;
        Ok(Self(root))
    }

    /// Encode as base-32 text
    #[must_use]
    pub fn to_base32(&self) -> String {
        encode_base32(&self.0)
    }
}

impl From<LeafHash> for ContentId {
    fn from(bytes: LeafHash) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base32(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_base32(&text).map_err(serde::de::Error::custom)
    }
}
