//! Canonical serialization and content hashing.
//!
//! Everything that participates in a content-addressed identity flows through
//! this module. The rules are the same ones that make replay possible:
//!
//! - Stable field order: struct fields serialize in declaration order
//! - Stable Vec order: vectors serialize in index order
//! - No HashMap allowed: use BTreeMap for maps in hashed data
//! - Text is normalized (CRLF/CR → LF, trimmed) before hashing
//!
//! ## Identity vs. convenience hashes
//!
//! Identities (message, document, call) are SHA-256 over canonical bytes and
//! are persisted. The xxh64 helpers are for cheap, non-identity digests such
//! as provider parameter fingerprints.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use xxhash_rust::xxh64::xxh64;

/// Version of the canonicalization scheme. Increment on any change to
/// [`normalize_text`] or the byte layouts below; doing so invalidates every
/// stored hash.
pub const CANONICAL_VERSION: &str = "1.0.0";

/// A 32-byte SHA-256 digest, hex-serialized.
///
/// Base type for the typed hash wrappers (`MessageHash`, `DocHash`,
/// `CallHash`). Implements `Ord` so stores can iterate deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let raw = hex::decode(s)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(bytes))
    }

    /// Hex representation (64 lowercase chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; full value via Display.
        write!(f, "Digest({}…)", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Serialize a value to canonical JSON bytes for hashing.
///
/// Deterministic for the same input. Only crate-internal types flow through
/// here, all of which serialize infallibly.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("canonical serialization failed")
}

/// SHA-256 over raw bytes.
pub fn sha256_digest(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest(hasher.finalize().into())
}

/// SHA-256 over the canonical serialization of a value.
pub fn canonical_digest<T: Serialize>(value: &T) -> Digest {
    sha256_digest(&to_canonical_bytes(value))
}

/// Derive a salted identity from a base digest.
///
/// Injective in `salt` for a fixed base: the salt is length-prefixed so no two
/// distinct salts can produce the same preimage. A collision here would be a
/// cache-reuse bug and is surfaced as `HashCollision` by the store, never
/// ignored.
pub fn condition_hash(base: &Digest, salt: &str) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(b"replay-kernel/condition/v1");
    hasher.update(base.as_bytes());
    hasher.update((salt.len() as u64).to_le_bytes());
    hasher.update(salt.as_bytes());
    Digest(hasher.finalize().into())
}

/// Normalize text to canonical form: CRLF/CR → LF, then trim.
///
/// Only the normalized form is hashed, so encoding artifacts (editor newline
/// style, trailing whitespace) never perturb a call identity.
pub fn normalize_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    normalized.trim().to_string()
}

/// Cheap xxh64 hash of a canonical serialization.
///
/// Not an identity; used for provider parameter fingerprints.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), 0)
}

/// [`canonical_hash`] as a 16-char hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_round_trip() {
        let d = sha256_digest(b"hello");
        let parsed = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn test_digest_serde_as_hex_string() {
        let d = sha256_digest(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn test_sha256_known_value() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_digest(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello\r\nWorld  "), "Hello\nWorld");
        assert_eq!(normalize_text("Hello\rWorld"), "Hello\nWorld");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_condition_hash_distinct_salts() {
        let base = sha256_digest(b"document");
        let a = condition_hash(&base, "a");
        let b = condition_hash(&base, "b");
        assert_ne!(a, b);
        assert_ne!(a, base);
    }

    #[test]
    fn test_condition_hash_deterministic() {
        let base = sha256_digest(b"document");
        assert_eq!(condition_hash(&base, "a"), condition_hash(&base, "a"));
    }

    #[test]
    fn test_condition_hash_no_concat_ambiguity() {
        let base = sha256_digest(b"x");
        assert_ne!(condition_hash(&base, "ab"), condition_hash(&base, "a b"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_normalize_text_idempotent(s in ".{0,200}") {
                let once = normalize_text(&s);
                prop_assert_eq!(normalize_text(&once), once);
            }

            #[test]
            fn prop_digest_hex_round_trip(bytes in prop::array::uniform32(any::<u8>())) {
                let d = Digest::from_bytes(bytes);
                prop_assert_eq!(Digest::from_hex(&d.to_hex()).unwrap(), d);
            }

            #[test]
            fn prop_condition_hash_injective_in_salt(a in ".{0,64}", b in ".{0,64}") {
                prop_assume!(a != b);
                let base = sha256_digest(b"document");
                prop_assert_ne!(condition_hash(&base, &a), condition_hash(&base, &b));
            }
        }
    }

    #[test]
    fn test_canonical_hash_determinism() {
        #[derive(Serialize)]
        struct Params {
            temperature: u32,
            top_p: u32,
        }
        let p = Params {
            temperature: 7,
            top_p: 9,
        };
        assert_eq!(canonical_hash(&p), canonical_hash(&p));
        assert_eq!(canonical_hash_hex(&p).len(), 16);
    }
}
