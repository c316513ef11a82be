use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// The only hash algorithm ctrd writes.
pub const ALGORITHM: &str = "blake3";

/// Content-addressed identifier for a blob.
///
/// The canonical string form is `blake3:<64 lowercase hex chars>`. Identical
/// content always produces the same `Digest`, which is what lets the content
/// store share blobs across namespaces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the digest of an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    /// Hex-encoded hash without the algorithm prefix.
    pub fn encoded(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 12 characters), for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Parse the canonical `algorithm:hex` form.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason: &str| TypeError::InvalidDigest {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (alg, encoded) = s.split_once(':').ok_or_else(|| invalid("missing algorithm prefix"))?;
        if alg != ALGORITHM {
            return Err(invalid("unsupported algorithm"));
        }
        if encoded.len() != 64 {
            return Err(invalid("expected 64 hex characters"));
        }
        if encoded.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("hex must be lowercase"));
        }
        let bytes = hex::decode(encoded).map_err(|e| invalid(&e.to_string()))?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({ALGORITHM}:{})", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.encoded())
    }
}

impl FromStr for Digest {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for streamed content.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: blake3::Hasher,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Digest of everything written so far. Does not reset the state.
    pub fn digest(&self) -> Digest {
        Digest(*self.hasher.finalize().as_bytes())
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester").field("digest", &self.digest()).finish()
    }
}
