//! Identifiers: content ids name archive bytes, commitment ids name pieces.
//!
//! Both are 32-byte digests rendered as 64 lowercase hex chars. They are kept
//! as distinct types so a payload cid can never be filed where a piece cid is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid identifier length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in identifier")]
    InvalidHex,
}

fn check_hex(s: &str) -> Result<String, HashError> {
    if s.len() != 64 {
        return Err(HashError::InvalidLength(s.len()));
    }
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HashError::InvalidHex);
    }
    Ok(s.to_lowercase())
}

/// BLAKE3 digest of a slice archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Hash data and return the content id.
    pub fn from_data(data: &[u8]) -> Self {
        Self(hex::encode(blake3::hash(data).as_bytes()))
    }

    /// Finish an incremental hasher.
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    /// Get the full id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_hex(s).map(Self)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Root of a piece commitment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitmentId([u8; 32]);

impl CommitmentId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CommitmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for CommitmentId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let checked = check_hex(s)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(checked, &mut bytes).map_err(|_| HashError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl Serialize for CommitmentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CommitmentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_produces_64_hex_chars() {
        let id = ContentId::from_data(b"Hello, World!");
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_from_data_matches_blake3() {
        let id = ContentId::from_data(b"slice bytes");
        assert_eq!(id.as_str(), blake3::hash(b"slice bytes").to_hex().as_str());
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"slice ");
        hasher.update(b"bytes");
        assert_eq!(ContentId::from_hasher(&hasher), ContentId::from_data(b"slice bytes"));
    }

    #[test]
    fn test_from_str_invalid_length() {
        let result: Result<ContentId, _> = "short".parse();
        assert!(matches!(result, Err(HashError::InvalidLength(5))));
    }

    #[test]
    fn test_from_str_invalid_hex() {
        let result: Result<ContentId, _> = "z".repeat(64).parse();
        assert!(matches!(result, Err(HashError::InvalidHex)));
    }

    #[test]
    fn test_commitment_id_display_parse() {
        let id = CommitmentId::from_bytes([0xab; 32]);
        let text = id.to_string();
        assert_eq!(text, "ab".repeat(32));
        let parsed: CommitmentId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_commitment_id_serde_as_string() {
        let id = CommitmentId::from_bytes([1; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }
}
