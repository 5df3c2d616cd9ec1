//! Resumable iteration over a table in ascending hash order.

use std::sync::Arc;
use std::time::Duration;

use crate::bucket_reader::BucketItem;
use crate::error::{TableError, TableResult};
use crate::hasher::{KeyHash, KeyHasher, HASH_LENGTH};
use crate::key_index::ContainerKeyIndex;
use crate::storage::SegmentAccess;
use crate::timer::TimeoutTimer;

const STATE_VERSION: u8 = 0;
const STATE_LENGTH: usize = 1 + HASH_LENGTH;

/// Resume token of a hash-ordered iteration: the last bucket hash visited.
///
/// Serialized as `[version: u8][hash: 16 bytes, big-endian]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorState {
    last_hash: KeyHash,
}

impl IteratorState {
    pub fn new(last_hash: KeyHash) -> Self {
        Self { last_hash }
    }

    pub fn last_hash(&self) -> KeyHash {
        self.last_hash
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_LENGTH);
        buf.push(STATE_VERSION);
        buf.extend_from_slice(&self.last_hash.to_bytes());
        buf
    }

    /// Parse a token produced by [`IteratorState::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> TableResult<Self> {
        if data.len() != STATE_LENGTH {
            return Err(TableError::data_format(0, format!("iterator state must be {} bytes, got {}", STATE_LENGTH, data.len())));
        }
        if data[0] != STATE_VERSION {
            return Err(TableError::data_format(0, format!("unsupported iterator state version {}", data[0])));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&data[1..]);
        Ok(Self { last_hash: KeyHash::from_bytes(hash) })
    }
}

/// One step of an iteration: live items of a range of buckets plus the token
/// to resume after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorItem<T> {
    pub state: Vec<u8>,
    pub entries: Vec<T>,
}

/// Pull-based iterator over the live keys or entries of one table segment.
///
/// Each call to [`TableIterator::next`] examines up to `fetch_buckets`
/// buckets, merging the durable index with the tail cache, and returns the
/// first range that holds at least one live item.
pub struct TableIterator<T> {
    segment: Arc<dyn SegmentAccess>,
    key_index: Arc<ContainerKeyIndex>,
    /// First hash not yet visited; `None` once the hash space is exhausted
    next_from: Option<KeyHash>,
    fetch_buckets: usize,
    fetch_timeout: Duration,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T: BucketItem> TableIterator<T> {
    /// Iterator starting after `state`, or at the first hash if `state` is `None`.
    pub(crate) fn new(
        segment: Arc<dyn SegmentAccess>,
        key_index: Arc<ContainerKeyIndex>,
        state: Option<IteratorState>,
        fetch_buckets: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            segment,
            key_index,
            next_from: KeyHasher::next_hash(state.map(|s| s.last_hash)),
            fetch_buckets: fetch_buckets.max(1),
            fetch_timeout,
            _item: std::marker::PhantomData,
        }
    }

    /// True once every bucket has been visited.
    pub fn is_done(&self) -> bool {
        self.next_from.is_none()
    }

    /// The next non-empty range of buckets, or `None` at the end.
    pub fn next(&mut self) -> TableResult<Option<IteratorItem<T>>> {
        let timer = TimeoutTimer::new(self.fetch_timeout);
        while let Some(from) = self.next_from {
            timer.check("iterator")?;
            let candidates = self.candidates(from, &timer)?;
            let Some(last) = candidates.last().copied() else {
                self.next_from = None;
                break;
            };

            let mut entries = Vec::new();
            for hash in candidates {
                entries.extend(self.key_index.find_all_existing::<T>(self.segment.as_ref(), hash, &timer)?);
            }
            self.next_from = KeyHasher::next_hash(Some(last));
            if !entries.is_empty() {
                return Ok(Some(IteratorItem { state: IteratorState::new(last).to_bytes(), entries }));
            }
        }
        Ok(None)
    }

    /// Up to `fetch_buckets` bucket hashes >= `from`, ascending, from both the
    /// durable index and the tail cache.
    fn candidates(&self, from: KeyHash, timer: &TimeoutTimer) -> TableResult<Vec<KeyHash>> {
        let durable = self.segment.index_range(from, self.fetch_buckets)?;
        let cached = self.key_index.unindexed_hashes(self.segment.as_ref(), timer)?;

        let mut merged: Vec<KeyHash> = durable
            .into_iter()
            .map(|(hash, _)| hash)
            .chain(cached.into_iter().filter(|hash| *hash >= from))
            .collect();
        merged.sort_unstable();
        merged.dedup();
        // If the durable page was full, every returned hash is at most its
        // last element, so no durable bucket is skipped.
        merged.truncate(self.fetch_buckets);
        Ok(merged)
    }
}
