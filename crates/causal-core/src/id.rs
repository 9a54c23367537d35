//! Content-addressed event identifiers.
//!
//! An [`Id`] is the text form `<algorithm>:<lowercase hex digest>`, e.g.
//! `blake3:9f86d0...`. Keys are assigned by the store from the event's
//! canonical content and are never chosen by callers.
//!
//! The hash function is injected through [`ContentHasher`]; the store
//! defaults to [`Blake3Hasher`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors from parsing an [`Id`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("id {0:?} has no `<algorithm>:` prefix")]
    MissingAlgorithm(String),
    #[error("id {0:?} has an invalid algorithm name")]
    InvalidAlgorithm(String),
    #[error("id {0:?} has an invalid hex digest")]
    InvalidDigest(String),
}

/// A content-addressed event key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id(String);

impl Id {
    /// Parse and validate the canonical text form.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the algorithm prefix is missing or not
    /// lowercase alphanumeric, or the digest is not non-empty even-length
    /// lowercase hex.
    pub fn parse(text: &str) -> Result<Self, IdError> {
        let Some((algorithm, digest)) = text.split_once(':') else {
            return Err(IdError::MissingAlgorithm(text.to_owned()));
        };
        if algorithm.is_empty()
            || !algorithm
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(IdError::InvalidAlgorithm(text.to_owned()));
        }
        if digest.is_empty()
            || digest.len() % 2 != 0
            || !digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(IdError::InvalidDigest(text.to_owned()));
        }
        Ok(Self(text.to_owned()))
    }

    /// Build an id from an algorithm name and raw digest bytes.
    #[must_use]
    pub fn from_digest(algorithm: &str, digest: &[u8]) -> Self {
        use fmt::Write as _;

        let mut text = String::with_capacity(algorithm.len() + 1 + digest.len() * 2);
        text.push_str(algorithm);
        text.push(':');
        for byte in digest {
            let _ = write!(text, "{byte:02x}");
        }
        Self(text)
    }

    /// Canonical text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical text form as bytes, used inside index keys.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Name of the hash algorithm that produced this id.
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(algorithm, _)| algorithm)
    }

    /// Decode an id previously written with [`Id::as_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the bytes are not a valid id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| IdError::MissingAlgorithm(String::from_utf8_lossy(bytes).into_owned()))?;
        Self::parse(text)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Id {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic hash from canonical event bytes to an [`Id`].
pub trait ContentHasher: Send + Sync + fmt::Debug {
    fn hash(&self, bytes: &[u8]) -> Id;
}

/// Default hasher: full 256-bit BLAKE3, `blake3:<64 hex>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn hash(&self, bytes: &[u8]) -> Id {
        let digest = blake3::hash(bytes);
        Id::from_digest("blake3", digest.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_ids_have_expected_shape() {
        let id = Blake3Hasher.hash(b"hello");
        assert!(id.as_str().starts_with("blake3:"));
        assert_eq!(id.as_str().len(), "blake3:".len() + 64);
        assert_eq!(id.algorithm(), "blake3");
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(Blake3Hasher.hash(b"abc"), Blake3Hasher.hash(b"abc"));
        assert_ne!(Blake3Hasher.hash(b"abc"), Blake3Hasher.hash(b"abd"));
    }

    #[test]
    fn parse_round_trips_display() {
        let id = Blake3Hasher.hash(b"x");
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(Id::from_bytes(id.as_bytes()).unwrap(), id);
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(matches!(Id::parse("abc"), Err(IdError::MissingAlgorithm(_))));
        assert!(matches!(Id::parse(":00"), Err(IdError::InvalidAlgorithm(_))));
        assert!(matches!(Id::parse("Blake3:00"), Err(IdError::InvalidAlgorithm(_))));
        assert!(matches!(Id::parse("blake3:"), Err(IdError::InvalidDigest(_))));
        assert!(matches!(Id::parse("blake3:abc"), Err(IdError::InvalidDigest(_))));
        assert!(matches!(Id::parse("blake3:ABCD"), Err(IdError::InvalidDigest(_))));
        assert!(matches!(Id::parse("blake3:zz"), Err(IdError::InvalidDigest(_))));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let id = Blake3Hasher.hash(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Id>("\"nope\"").is_err());
    }
}
