//! Walks bucket chains by following record backpointers.
//!
//! A chain starts at the bucket head and visits strictly decreasing offsets.
//! Reading the head below the truncation point fails with `Truncated` (the
//! head is stale). Any later link below the truncation point ends the chain,
//! since compaction relocates every live record before truncating.

use std::marker::PhantomData;

use hashbrown::HashSet;

use crate::entry::{TableEntry, TableKey};
use crate::error::{TableError, TableResult};
use crate::serializer::{EntryHeader, EntrySerializer, LogRecord, HEADER_SIZE};
use crate::storage::SegmentAccess;
use crate::timer::TimeoutTimer;

/// Something a chain walk can produce from a live record.
pub trait BucketItem: Sized {
    fn from_record(record: LogRecord) -> Self;
}

impl BucketItem for TableEntry {
    fn from_record(record: LogRecord) -> Self {
        TableEntry::versioned(record.key, record.value.unwrap_or_default(), record.version)
    }
}

impl BucketItem for TableKey {
    fn from_record(record: LogRecord) -> Self {
        TableKey::versioned(record.key, record.version)
    }
}

/// Chain reader producing keys or entries.
pub struct TableBucketReader<'a, T> {
    segment: &'a dyn SegmentAccess,
    serializer: EntrySerializer,
    _item: PhantomData<fn() -> T>,
}

impl<'a> TableBucketReader<'a, TableEntry> {
    /// Reader returning full entries.
    pub fn entry(segment: &'a dyn SegmentAccess) -> Self {
        Self::new(segment)
    }
}

impl<'a> TableBucketReader<'a, TableKey> {
    /// Reader returning keys with their versions.
    pub fn key(segment: &'a dyn SegmentAccess) -> Self {
        Self::new(segment)
    }
}

impl<'a, T: BucketItem> TableBucketReader<'a, T> {
    pub(crate) fn new(segment: &'a dyn SegmentAccess) -> Self {
        Self { segment, serializer: EntrySerializer::new(), _item: PhantomData }
    }

    /// Newest record of `key` reachable from `head`; `None` if absent or removed.
    pub fn find(&self, key: &[u8], head: u64, timer: &TimeoutTimer) -> TableResult<Option<T>> {
        let mut next = Some(head);
        let mut first = true;
        while let Some(offset) = next {
            timer.check("find")?;
            let Some(header) = self.chain_header(offset, first)? else {
                return Ok(None);
            };
            first = false;

            if header.key_length == key.len() {
                let record = self.read_record(offset, &header)?;
                if record.key == key {
                    return Ok(if record.is_deletion() { None } else { Some(T::from_record(record)) });
                }
            }
            next = header.backpointer;
        }
        Ok(None)
    }

    /// The newest live record of every distinct key reachable from `head`,
    /// newest first. Older records of a key already seen are shadowed.
    pub fn find_all_existing(&self, head: u64, timer: &TimeoutTimer) -> TableResult<Vec<T>> {
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut result = Vec::new();
        let mut next = Some(head);
        let mut first = true;
        while let Some(offset) = next {
            timer.check("find_all")?;
            let Some(header) = self.chain_header(offset, first)? else {
                break;
            };
            first = false;

            let record = self.read_record(offset, &header)?;
            next = record.backpointer;
            if seen.contains(&record.key) {
                continue;
            }
            seen.insert(record.key.clone());
            if !record.is_deletion() {
                result.push(T::from_record(record));
            }
        }
        Ok(result)
    }

    /// Header of the chain record at `offset`. `None` ends the chain.
    fn chain_header(&self, offset: u64, is_head: bool) -> TableResult<Option<EntryHeader>> {
        let data = match self.segment.read(offset, HEADER_SIZE) {
            Ok(data) => data,
            Err(e) if e.is_truncated() && !is_head => return Ok(None),
            Err(e) => return Err(e),
        };
        self.serializer
            .read_header(&data, offset)?
            .map(Some)
            .ok_or_else(|| TableError::data_format(offset, "incomplete record header"))
    }

    fn read_record(&self, offset: u64, header: &EntryHeader) -> TableResult<LogRecord> {
        let data = self.segment.read(offset, header.total_length)?;
        self.serializer
            .read_record(&data, offset)?
            .ok_or_else(|| TableError::data_format(offset, "incomplete record"))
    }
}
