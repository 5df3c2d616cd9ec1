//! Table keys, entries and key versions.
//!
//! A key's version is the segment offset of the record that currently
//! commits it. Callers attach a [`KeyVersion`] to a key to make an update
//! conditional on that version.

use std::fmt;

/// Version condition attached to a [`TableKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVersion {
    /// No condition: the update applies regardless of the current version
    Any,
    /// The key must not exist (or must be removed)
    NotExists,
    /// The key must currently be committed at this segment offset
    Exact(u64),
}

impl KeyVersion {
    /// True if this version carries a condition.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, KeyVersion::Any)
    }

    /// The offset for an exact version.
    pub fn offset(&self) -> Option<u64> {
        match self {
            KeyVersion::Exact(offset) => Some(*offset),
            _ => None,
        }
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyVersion::Any => write!(f, "any"),
            KeyVersion::NotExists => write!(f, "not exists"),
            KeyVersion::Exact(offset) => write!(f, "{}", offset),
        }
    }
}

/// A key plus its version (expected version on input, committed version on output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKey {
    pub key: Vec<u8>,
    pub version: KeyVersion,
}

impl TableKey {
    /// A key with no version condition.
    pub fn unversioned(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), version: KeyVersion::Any }
    }

    /// A key that must not exist.
    pub fn not_exists(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), version: KeyVersion::NotExists }
    }

    /// A key that must currently be at `version`.
    pub fn versioned(key: impl Into<Vec<u8>>, version: u64) -> Self {
        Self { key: key.into(), version: KeyVersion::Exact(version) }
    }

    pub fn is_conditional(&self) -> bool {
        self.version.is_conditional()
    }
}

/// A key with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub key: TableKey,
    pub value: Vec<u8>,
}

impl TableEntry {
    /// An unconditional entry.
    pub fn unversioned(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: TableKey::unversioned(key), value: value.into() }
    }

    /// An entry that may only be inserted if the key does not exist.
    pub fn not_exists(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: TableKey::not_exists(key), value: value.into() }
    }

    /// An entry that replaces the key only if it is currently at `version`.
    pub fn versioned(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: u64) -> Self {
        Self { key: TableKey::versioned(key, version), value: value.into() }
    }

    /// Committed version, if this entry came back from a read.
    pub fn version(&self) -> Option<u64> {
        self.key.version.offset()
    }
}
