//! Accumulates the keys of one put or remove call.

use crate::entry::TableKey;
use crate::error::{TableError, TableResult};
use crate::hasher::KeyHash;

/// One key of a [`TableKeyBatch`].
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub key: TableKey,
    pub hash: KeyHash,
    /// Offset of this item's record relative to the start of the batch
    pub offset: usize,
    pub length: usize,
}

/// Keys of one update or removal, with their hashes and serialized layout.
#[derive(Debug, Clone)]
pub struct TableKeyBatch {
    items: Vec<BatchItem>,
    removal: bool,
    length: usize,
    conditional_count: usize,
}

impl TableKeyBatch {
    /// Batch for a put call.
    pub fn update() -> Self {
        Self::new(false)
    }

    /// Batch for a remove call.
    pub fn removal() -> Self {
        Self::new(true)
    }

    fn new(removal: bool) -> Self {
        Self { items: Vec::new(), removal, length: 0, conditional_count: 0 }
    }

    /// Add a key whose record serializes to `length` bytes.
    pub fn add(&mut self, key: TableKey, hash: KeyHash, length: usize) {
        if key.is_conditional() {
            self.conditional_count += 1;
        }
        self.items.push(BatchItem { key, hash, offset: self.length, length });
        self.length += length;
    }

    /// Fail with `CapacityExceeded` if the serialized batch would exceed `max`.
    pub fn check_length(&self, max: usize) -> TableResult<()> {
        if self.length > max {
            return Err(TableError::CapacityExceeded { length: self.length, max });
        }
        Ok(())
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total serialized length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_removal(&self) -> bool {
        self.removal
    }

    /// True if at least one key carries a version condition.
    pub fn is_conditional(&self) -> bool {
        self.conditional_count > 0
    }

    /// True if every key carries a version condition.
    pub fn is_fully_conditional(&self) -> bool {
        !self.items.is_empty() && self.conditional_count == self.items.len()
    }

    /// Distinct hashes in ascending order (the lock acquisition order).
    pub fn hashes(&self) -> Vec<KeyHash> {
        let mut hashes: Vec<KeyHash> = self.items.iter().map(|i| i.hash).collect();
        hashes.sort_unstable();
        hashes.dedup();
        hashes
    }
}
