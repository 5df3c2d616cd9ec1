//! Key hashing and hash-space ordering.
//!
//! Keys are grouped into buckets by a 128-bit hash. Distinct keys may share a
//! hash; lookups always compare raw key bytes, never hashes alone.

use std::fmt;

use sha2::{Digest, Sha256};

/// Width of a serialized [`KeyHash`] in bytes
pub const HASH_LENGTH: usize = 16;

/// Fixed-width key digest. Ordered numerically, which is the iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyHash(u128);

impl KeyHash {
    /// Smallest hash; iteration starts here
    pub const MIN: KeyHash = KeyHash(0);
    /// Largest hash; iteration ends after it
    pub const MAX: KeyHash = KeyHash(u128::MAX);

    pub const fn new(value: u128) -> Self {
        KeyHash(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    /// Big-endian bytes, so byte order matches numeric order.
    pub fn to_bytes(&self) -> [u8; HASH_LENGTH] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        KeyHash(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Deterministic key -> [`KeyHash`] function.
#[derive(Clone, Copy)]
pub struct KeyHasher {
    hash_fn: fn(&[u8]) -> KeyHash,
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHasher").finish_non_exhaustive()
    }
}

impl KeyHasher {
    /// SHA-256 truncated to the first 16 bytes.
    pub fn sha256() -> Self {
        Self { hash_fn: sha256_hash }
    }

    /// Custom hash function. Used to force collisions in tests.
    pub fn custom(hash_fn: fn(&[u8]) -> KeyHash) -> Self {
        Self { hash_fn }
    }

    pub fn hash(&self, key: &[u8]) -> KeyHash {
        (self.hash_fn)(key)
    }

    /// Successor of `hash` in iteration order. `None` input yields the
    /// minimum hash; the successor of [`KeyHash::MAX`] is `None` (end).
    pub fn next_hash(hash: Option<KeyHash>) -> Option<KeyHash> {
        match hash {
            None => Some(KeyHash::MIN),
            Some(h) => h.0.checked_add(1).map(KeyHash),
        }
    }
}

impl Default for KeyHasher {
    fn default() -> Self { Self::sha256() }
}

fn sha256_hash(key: &[u8]) -> KeyHash {
    let digest = Sha256::digest(key);
    let mut bytes = [0u8; HASH_LENGTH];
    bytes.copy_from_slice(&digest[..HASH_LENGTH]);
    KeyHash::from_bytes(bytes)
}
