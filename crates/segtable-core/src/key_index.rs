//! Hash to offset resolution for the table segments of one container.
//!
//! Each table segment gets a [`SegmentTail`]: the tail cache of bucket heads
//! appended since the durable index offset, the watermark up to which the
//! durable index is complete, per-hash locks and the table gate. A segment's
//! tail lives until the segment is removed from the index; its cached state
//! is recovered from the log the first time the segment is touched and again
//! after the writer drops it.
//!
//! Lookups take the newest of the cached and the durable head. Writers hold
//! the locks of every hash they touch, so the head a writer reads is still
//! the head when its append lands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::batch::TableKeyBatch;
use crate::bucket_reader::{BucketItem, TableBucketReader};
use crate::config::Config;
use crate::entry::{KeyVersion, TableKey};
use crate::error::{TableError, TableResult};
use crate::hasher::{KeyHash, KeyHasher};
use crate::locks::HashLocks;
use crate::storage::{scan_records, SegmentAccess};
use crate::timer::TimeoutTimer;

/// Durable buckets fetched per page when scanning a whole table.
const SCAN_PAGE: usize = 1024;

/// How each item of a batch links into its bucket chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// First item of its hash in the batch: points at the current head
    Head(Option<u64>),
    /// Points at an earlier item of the same hash (relative batch offset)
    InBatch(usize),
}

/// Backpointers of one batch, resolved once the base offset is known.
#[derive(Debug, Clone)]
pub struct BatchLinks {
    links: Vec<Link>,
}

impl BatchLinks {
    fn new(batch: &TableKeyBatch, heads: &HashMap<KeyHash, Option<u64>>) -> Self {
        let mut previous: HashMap<KeyHash, usize> = HashMap::new();
        let links = batch
            .items()
            .iter()
            .map(|item| match previous.insert(item.hash, item.offset) {
                Some(earlier) => Link::InBatch(earlier),
                None => Link::Head(heads.get(&item.hash).copied().flatten()),
            })
            .collect();
        Self { links }
    }

    /// Backpointer of every batch item when the batch is appended at `base`.
    pub fn backpointers(&self, base: u64) -> Vec<Option<u64>> {
        self.links
            .iter()
            .map(|link| match link {
                Link::Head(head) => *head,
                Link::InBatch(relative) => Some(base + *relative as u64),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct TailState {
    /// Entries and watermark reflect the log; false until recovered
    recovered: bool,
    /// Durable index offset as last notified
    watermark: Option<u64>,
    /// Bucket heads appended at or after the watermark
    entries: HashMap<KeyHash, u64>,
}

/// In-memory state of one table segment.
///
/// The gate and locks are never replaced while the segment is known, so every
/// caller contends on the same ones. Resetting the cached state only clears
/// `state`.
struct SegmentTail {
    /// Shared while the cached state is in use; exclusive for recovery, reset
    /// and `execute_if_empty`
    gate: RwLock<()>,
    locks: HashLocks,
    state: RwLock<TailState>,
}

impl SegmentTail {
    fn new() -> Self {
        Self { gate: RwLock::new(()), locks: HashLocks::new(), state: RwLock::new(TailState::default()) }
    }

    fn is_recovered(&self) -> bool {
        self.state.read().recovered
    }

    fn cached(&self, hash: &KeyHash) -> Option<u64> {
        self.state.read().entries.get(hash).copied()
    }

    fn record(&self, hash: KeyHash, offset: u64) {
        let mut state = self.state.write();
        let head = state.entries.entry(hash).or_insert(offset);
        if *head < offset {
            *head = offset;
        }
    }
}

/// Coordinates lookups and conditional updates for every table segment of
/// one container.
pub struct ContainerKeyIndex {
    container_id: u64,
    hasher: KeyHasher,
    recovery_read_size: usize,
    tails: RwLock<HashMap<u64, Arc<SegmentTail>>>,
    closed: AtomicBool,
}

impl ContainerKeyIndex {
    pub fn new(container_id: u64, hasher: KeyHasher, config: &Config) -> Self {
        Self {
            container_id,
            hasher,
            recovery_read_size: config.delta_read_size,
            tails: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn container_id(&self) -> u64 {
        self.container_id
    }

    /// Check versions, then append through `commit` and cache the new heads.
    ///
    /// All hashes of the batch stay locked from version check to cache
    /// update. `commit` receives the batch backpointers and returns the base
    /// offset of the append. Returns the committed offset of every batch item.
    pub fn update<F>(
        &self,
        segment: &dyn SegmentAccess,
        batch: &TableKeyBatch,
        commit: F,
        timer: &TimeoutTimer,
    ) -> TableResult<Vec<u64>>
    where
        F: FnOnce(&BatchLinks) -> TableResult<u64>,
    {
        self.with_tail(segment, timer, "update", |tail| {
            let hashes = batch.hashes();
            let _locks = tail.locks.lock_all(&hashes, timer)?;

            let resolved = self.resolve_heads(tail, segment, &hashes)?;
            let heads: HashMap<KeyHash, Option<u64>> = hashes.iter().copied().zip(resolved).collect();
            if batch.is_conditional() {
                self.check_versions(segment, batch, &heads, timer)?;
            }

            let links = BatchLinks::new(batch, &heads);
            timer.check("update")?;
            let base = commit(&links)?;

            let offsets: Vec<u64> = batch.items().iter().map(|item| base + item.offset as u64).collect();
            for (item, offset) in batch.items().iter().zip(&offsets) {
                tail.record(item.hash, *offset);
            }
            Ok(offsets)
        })
    }

    fn check_versions(
        &self,
        segment: &dyn SegmentAccess,
        batch: &TableKeyBatch,
        heads: &HashMap<KeyHash, Option<u64>>,
        timer: &TimeoutTimer,
    ) -> TableResult<()> {
        let reader = TableBucketReader::<TableKey>::new(segment);
        for item in batch.items().iter().filter(|i| i.key.is_conditional()) {
            let current = match heads.get(&item.hash).copied().flatten() {
                None => None,
                Some(head) => self
                    .read_with_retry(segment, item.hash, head, |h| reader.find(&item.key.key, h, timer))?
                    .flatten(),
            };
            let actual = current.map_or(KeyVersion::NotExists, |k| k.version);
            if actual != item.key.version {
                return Err(TableError::BadVersion {
                    key: item.key.key.clone(),
                    expected: item.key.version,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Bucket heads of `hashes`, in order: the newer of the cached and the
    /// durable head. `None` if the bucket does not exist.
    pub fn resolve(
        &self,
        segment: &dyn SegmentAccess,
        hashes: &[KeyHash],
        timer: &TimeoutTimer,
    ) -> TableResult<Vec<Option<u64>>> {
        self.with_tail(segment, timer, "resolve", |tail| self.resolve_heads(tail, segment, hashes))
    }

    fn resolve_heads(
        &self,
        tail: &SegmentTail,
        segment: &dyn SegmentAccess,
        hashes: &[KeyHash],
    ) -> TableResult<Vec<Option<u64>>> {
        let cached: Vec<Option<u64>> = {
            let state = tail.state.read();
            hashes.iter().map(|h| state.entries.get(h).copied()).collect()
        };
        let durable = segment.index_get(hashes)?;
        Ok(cached.into_iter().zip(durable).map(|(c, d)| c.max(d)).collect())
    }

    /// Durable head of `hash`, bypassing the tail cache.
    pub fn resolve_direct(&self, segment: &dyn SegmentAccess, hash: KeyHash) -> TableResult<Option<u64>> {
        self.ensure_open()?;
        Ok(segment.index_get(&[hash])?.into_iter().next().flatten())
    }

    /// Run `read` against `head`; if the head turns out to be truncated,
    /// re-resolve it from the durable index and try once more. `None` if the
    /// bucket no longer exists.
    fn read_with_retry<R>(
        &self,
        segment: &dyn SegmentAccess,
        hash: KeyHash,
        head: u64,
        read: impl Fn(u64) -> TableResult<R>,
    ) -> TableResult<Option<R>> {
        match read(head) {
            Err(e) if e.is_truncated() => {
                tracing::warn!(
                    "{} bucket {} head {} is truncated; retrying with durable head",
                    self.trace_id(),
                    hash,
                    head
                );
                match self.resolve_direct(segment, hash)? {
                    None => Ok(None),
                    Some(direct) if direct != head => read(direct).map(Some),
                    Some(_) => Err(e),
                }
            }
            other => other.map(Some),
        }
    }

    /// Current value of `key` (whose hash is `hash`), or `None`.
    pub fn find<T: BucketItem>(
        &self,
        segment: &dyn SegmentAccess,
        key: &[u8],
        hash: KeyHash,
        timer: &TimeoutTimer,
    ) -> TableResult<Option<T>> {
        let Some(head) = self.resolve(segment, &[hash], timer)?.into_iter().next().flatten() else {
            return Ok(None);
        };
        let reader = TableBucketReader::<T>::new(segment);
        Ok(self.read_with_retry(segment, hash, head, |h| reader.find(key, h, timer))?.flatten())
    }

    /// Every live key of the bucket `hash`, newest first.
    pub fn find_all_existing<T: BucketItem>(
        &self,
        segment: &dyn SegmentAccess,
        hash: KeyHash,
        timer: &TimeoutTimer,
    ) -> TableResult<Vec<T>> {
        let Some(head) = self.resolve(segment, &[hash], timer)?.into_iter().next().flatten() else {
            return Ok(Vec::new());
        };
        let reader = TableBucketReader::<T>::new(segment);
        Ok(self
            .read_with_retry(segment, hash, head, |h| reader.find_all_existing(h, timer))?
            .unwrap_or_default())
    }

    /// Run `action` only if the table has no live entries.
    ///
    /// Holds the table gate exclusively across the check and the action, so
    /// no update can commit in between.
    pub fn execute_if_empty<R>(
        &self,
        segment: &dyn SegmentAccess,
        action: impl FnOnce() -> TableResult<R>,
        timer: &TimeoutTimer,
    ) -> TableResult<R> {
        let tail = self.tail(segment.segment_id())?;
        let _gate = tail
            .gate
            .try_write_for(timer.remaining())
            .ok_or(TableError::Timeout { operation: "execute_if_empty" })?;
        self.ensure_recovered(&tail, segment, timer)?;

        if self.has_live_entries(&tail, segment, timer)? {
            return Err(TableError::NotEmpty { segment: segment.info()?.name });
        }
        action()
    }

    fn has_live_entries(&self, tail: &SegmentTail, segment: &dyn SegmentAccess, timer: &TimeoutTimer) -> TableResult<bool> {
        let reader = TableBucketReader::<TableKey>::new(segment);
        let has_live = |hash: KeyHash, head: u64| -> TableResult<bool> {
            let live = self.read_with_retry(segment, hash, head, |h| reader.find_all_existing(h, timer))?;
            Ok(live.map_or(false, |keys| !keys.is_empty()))
        };

        let cached: Vec<(KeyHash, u64)> = tail.state.read().entries.iter().map(|(h, o)| (*h, *o)).collect();
        for (hash, head) in cached {
            if has_live(hash, head)? {
                return Ok(true);
            }
        }

        let mut from = Some(KeyHash::MIN);
        while let Some(start) = from {
            let page = segment.index_range(start, SCAN_PAGE)?;
            for (hash, durable) in &page {
                let head = tail.cached(hash).map_or(*durable, |c| c.max(*durable));
                if has_live(*hash, head)? {
                    return Ok(true);
                }
            }
            from = match page.last() {
                Some((last, _)) if page.len() == SCAN_PAGE => KeyHasher::next_hash(Some(*last)),
                _ => None,
            };
        }
        Ok(false)
    }

    /// Called once the durable index covers the log up to `offset`. Cached
    /// heads below it are dropped. `None` drops the segment's cached state;
    /// it is recovered from the log on next use. The segment's locks stay in
    /// place, and the reset waits for in-flight updates to finish.
    pub fn notify_durable_offset_advanced(&self, segment_id: u64, offset: Option<u64>) {
        let Some(tail) = self.tails.read().get(&segment_id).cloned() else {
            return;
        };
        match offset {
            Some(offset) => {
                let mut state = tail.state.write();
                if !state.recovered {
                    return;
                }
                if state.watermark.map_or(true, |w| w <= offset) {
                    state.watermark = Some(offset);
                }
                state.entries.retain(|_, head| *head >= offset);
            }
            None => {
                let _gate = tail.gate.write();
                *tail.state.write() = TailState::default();
            }
        }
    }

    /// Hashes with heads not yet in the durable index, ascending.
    pub fn unindexed_hashes(&self, segment: &dyn SegmentAccess, timer: &TimeoutTimer) -> TableResult<Vec<KeyHash>> {
        self.with_tail(segment, timer, "unindexed_hashes", |tail| {
            let mut hashes: Vec<KeyHash> = tail.state.read().entries.keys().copied().collect();
            hashes.sort_unstable();
            Ok(hashes)
        })
    }

    /// Number of cached heads for a segment (0 if it has no tail).
    pub fn tail_entry_count(&self, segment_id: u64) -> usize {
        self.tails.read().get(&segment_id).map_or(0, |t| t.state.read().entries.len())
    }

    /// Durable index offset as last notified for a segment.
    pub fn watermark(&self, segment_id: u64) -> Option<u64> {
        self.tails.read().get(&segment_id).and_then(|t| t.state.read().watermark)
    }

    /// Forget a deleted segment.
    pub fn remove_segment(&self, segment_id: u64) {
        self.tails.write().remove(&segment_id);
    }

    /// Drop all state. Later calls fail with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.tails.write().clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> TableResult<()> {
        if self.is_closed() {
            return Err(TableError::Closed);
        }
        Ok(())
    }

    fn trace_id(&self) -> String {
        format!("KeyIndex[{}]", self.container_id)
    }

    /// The tail of a segment, created empty on first use.
    fn tail(&self, segment_id: u64) -> TableResult<Arc<SegmentTail>> {
        self.ensure_open()?;
        if let Some(tail) = self.tails.read().get(&segment_id) {
            return Ok(Arc::clone(tail));
        }
        let mut tails = self.tails.write();
        self.ensure_open()?;
        Ok(Arc::clone(tails.entry(segment_id).or_insert_with(|| Arc::new(SegmentTail::new()))))
    }

    /// Run `action` with the tail of `segment` recovered and its gate held
    /// shared. Recovery itself runs with the gate held exclusively, so no
    /// update is in flight while the log is scanned.
    fn with_tail<R>(
        &self,
        segment: &dyn SegmentAccess,
        timer: &TimeoutTimer,
        operation: &'static str,
        action: impl FnOnce(&SegmentTail) -> TableResult<R>,
    ) -> TableResult<R> {
        let tail = self.tail(segment.segment_id())?;
        let gate = loop {
            let gate = tail.gate.try_read_for(timer.remaining()).ok_or(TableError::Timeout { operation })?;
            if tail.is_recovered() {
                break gate;
            }
            drop(gate);

            timer.check(operation)?;
            let _exclusive = tail.gate.try_write_for(timer.remaining()).ok_or(TableError::Timeout { operation })?;
            self.ensure_recovered(&tail, segment, timer)?;
        };
        let result = action(&tail);
        drop(gate);
        result
    }

    /// Rebuild the cached state from the log bytes the durable index has not
    /// yet covered, unless that already happened. The caller holds the gate
    /// exclusively.
    fn ensure_recovered(&self, tail: &SegmentTail, segment: &dyn SegmentAccess, timer: &TimeoutTimer) -> TableResult<()> {
        if tail.is_recovered() {
            return Ok(());
        }
        let info = segment.info()?;
        let Some(index_offset) = info.attributes.index_offset else {
            return Err(TableError::NotATableSegment { segment: info.name });
        };

        let mut entries: HashMap<KeyHash, u64> = HashMap::new();
        let end = scan_records(segment, index_offset, info.length, self.recovery_read_size, timer, |record| {
            let head = entries.entry(self.hasher.hash(&record.key)).or_insert(record.version);
            if *head < record.version {
                *head = record.version;
            }
            Ok(())
        })?;

        if end < info.length {
            tracing::warn!(
                "{} segment '{}' has {} unparseable trailing bytes after offset {}",
                self.trace_id(),
                info.name,
                info.length - end,
                end
            );
        }
        if !entries.is_empty() {
            tracing::debug!(
                "{} recovered {} cached heads for '{}' from [{}, {})",
                self.trace_id(),
                entries.len(),
                info.name,
                index_offset,
                end
            );
        }

        *tail.state.write() = TailState { recovered: true, watermark: Some(index_offset), entries };
        Ok(())
    }
}
