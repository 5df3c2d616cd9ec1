//! Append-only segment storage consumed by the table core.
//!
//! The table core only talks to segments through [`SegmentAccess`]. The
//! file-backed [`DirectSegment`] and [`SegmentContainer`] implement it so
//! tables are usable end to end.

mod container;
mod segment;
pub mod sync;

pub use container::SegmentContainer;
pub use segment::DirectSegment;

use crate::error::TableResult;
use crate::hasher::KeyHash;
use crate::serializer::{EntrySerializer, LogRecord};
use crate::timer::TimeoutTimer;

/// Segment attributes. `index_offset` being present marks a table segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentAttributes {
    /// Offset up to which the durable hash index is complete (exclusive)
    pub index_offset: Option<u64>,
    /// Compaction trigger percentage
    pub min_utilization: u8,
    /// Live keys, as counted by the indexer
    pub entry_count: u64,
    /// Records between the start offset and the index offset
    pub total_entry_count: u64,
}

impl SegmentAttributes {
    /// Attributes of a freshly created table segment.
    pub fn table(min_utilization: u8) -> Self {
        Self { index_offset: Some(0), min_utilization, entry_count: 0, total_entry_count: 0 }
    }

    pub fn is_table_segment(&self) -> bool {
        self.index_offset.is_some()
    }
}

/// Point-in-time view of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    /// Offsets below this have been truncated
    pub start_offset: u64,
    /// Offset of the next append
    pub length: u64,
    pub attributes: SegmentAttributes,
}

/// Changes applied atomically to the durable index and its attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexUpdate {
    /// New bucket heads; `None` removes the bucket
    pub buckets: Vec<(KeyHash, Option<u64>)>,
    /// New index offset, if it advances
    pub index_offset: Option<u64>,
    pub entry_count_delta: i64,
    pub total_entry_count_delta: i64,
}

/// Builds the bytes of one append from its base offset.
pub type AppendBuilder<'a> = dyn FnMut(u64) -> TableResult<Vec<u8>> + 'a;

/// Operations the table core needs from one segment.
pub trait SegmentAccess: Send + Sync {
    /// Process-unique id of this segment instance.
    fn segment_id(&self) -> u64;

    /// Current start offset, length and attributes. `NotFound` once deleted.
    fn info(&self) -> TableResult<SegmentInfo>;

    /// Read up to `max_length` bytes at `offset`; shorter at the end of the
    /// segment. `Truncated` below the start offset.
    fn read(&self, offset: u64, max_length: usize) -> TableResult<Vec<u8>>;

    /// Append the bytes produced by `build`, which receives the base offset.
    /// With `expected_offset`, fails with `BadOffset` unless the segment
    /// length matches. All-or-nothing; returns the base offset.
    fn append(&self, expected_offset: Option<u64>, build: &mut AppendBuilder<'_>) -> TableResult<u64>;

    /// Raise the start offset; bytes below it become unreadable.
    fn truncate(&self, offset: u64) -> TableResult<()>;

    /// Durable bucket heads for `hashes`, in order.
    fn index_get(&self, hashes: &[KeyHash]) -> TableResult<Vec<Option<u64>>>;

    /// Up to `limit` durable buckets with hash >= `from`, ascending.
    fn index_range(&self, from: KeyHash, limit: usize) -> TableResult<Vec<(KeyHash, u64)>>;

    /// Apply `update` to the durable index and persist it.
    fn index_update(&self, update: &IndexUpdate) -> TableResult<()>;
}

/// Visit every whole record in `[from, to)`, reading `read_size` bytes at a
/// time. A record that does not end before `to` is not visited. Returns the
/// offset after the last visited record.
pub(crate) fn scan_records(
    segment: &dyn SegmentAccess,
    from: u64,
    to: u64,
    read_size: usize,
    timer: &TimeoutTimer,
    mut visit: impl FnMut(LogRecord) -> TableResult<()>,
) -> TableResult<u64> {
    let serializer = EntrySerializer::new();
    let mut position = from;
    while position < to {
        timer.check("scan")?;
        let length = ((to - position) as usize).min(read_size);
        let data = segment.read(position, length)?;
        let records = serializer.read_records(&data, position)?;
        if records.is_empty() {
            break;
        }
        for record in records {
            position = record.next_offset();
            visit(record)?;
        }
    }
    Ok(position)
}
