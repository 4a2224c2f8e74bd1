use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest, Sha256};

use crate::to_canonical_cbor;

const PREFIX: &str = "sha256:";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HashError {
    #[error("expected '{PREFIX}' before the digest")]
    MissingPrefix,
    #[error("digest must be 64 hex characters, got {0}")]
    Length(usize),
    #[error("digest is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// SHA-256 digest. Transaction ids, state hashes and code digests are all
/// hashes of canonical CBOR.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Hash(Sha256::digest(bytes).into())
    }

    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        to_canonical_cbor(value).map(|bytes| Self::of_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex digits only; version ids embed this form.
    pub fn to_bare_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_bare_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != 64 {
            return Err(HashError::Length(s.len()));
        }
        let mut digest = [0u8; 32];
        hex::decode_to_slice(s, &mut digest)?;
        Ok(Hash(digest))
    }

    /// Eight hex digits for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.to_bare_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = s.strip_prefix(PREFIX).ok_or(HashError::MissingPrefix)?;
        Self::from_bare_hex(digest)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let hash = Hash::of_bytes(b"ledger");
        let text = hash.to_string();
        assert!(text.starts_with("sha256:"));
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
        assert_eq!(Hash::from_bare_hex(&hash.to_bare_hex()).unwrap(), hash);
        assert_eq!(hash.short().len(), 8);
    }

    #[test]
    fn malformed_digests_are_rejected() {
        assert_eq!("abcd".parse::<Hash>(), Err(HashError::MissingPrefix));
        assert_eq!(Hash::from_bare_hex("abcd"), Err(HashError::Length(4)));
        assert!(matches!(
            Hash::from_bare_hex(&"zz".repeat(32)),
            Err(HashError::Hex(_))
        ));
    }

    #[test]
    fn serializes_as_prefixed_text() {
        let hash = Hash::of_bytes(b"state");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<Hash>(&json).unwrap(), hash);
    }
}
