//! Log-ordered iteration over a window of a table segment.
//!
//! The window is `[from_position, end)`, where `end` is the segment length
//! when the iterator is created. A record is part of the window iff it starts
//! before `end`; the cursor advances by whole records only, so resuming from
//! an emitted state never repeats or skips a record. Removals are emitted as
//! deletion records rather than omitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::entry::TableEntry;
use crate::error::{TableError, TableResult};
use crate::serializer::EntrySerializer;
use crate::storage::SegmentAccess;
use crate::timer::TimeoutTimer;

const STATE_VERSION: u8 = 0;
const STATE_LENGTH: usize = 1 + 8 + 1;
const FLAG_REACHED_END: u8 = 0x01;
const FLAG_SHOULD_CLEAR: u8 = 0x02;
const FLAG_DELETION: u8 = 0x04;

/// Position of a delta iteration after one record.
///
/// Serialized as `[version: u8][from_position: u64 LE][flags: u8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaIteratorState {
    /// Where to resume: the offset after the record this state belongs to
    pub from_position: u64,
    /// The record was the last one of the window
    pub reached_end: bool,
    /// The requested start was truncated away; consumers should drop any
    /// state built from earlier deltas
    pub should_clear: bool,
    /// The record is a removal
    pub deletion_record: bool,
}

impl DeltaIteratorState {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(STATE_LENGTH);
        buf.push(STATE_VERSION);
        buf.extend_from_slice(&self.from_position.to_le_bytes());
        let mut flags = 0u8;
        if self.reached_end {
            flags |= FLAG_REACHED_END;
        }
        if self.should_clear {
            flags |= FLAG_SHOULD_CLEAR;
        }
        if self.deletion_record {
            flags |= FLAG_DELETION;
        }
        buf.push(flags);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> TableResult<Self> {
        if data.len() != STATE_LENGTH || data[0] != STATE_VERSION {
            return Err(TableError::data_format(0, "malformed delta iterator state"));
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(&data[1..9]);
        let flags = data[9];
        Ok(Self {
            from_position: u64::from_le_bytes(position),
            reached_end: flags & FLAG_REACHED_END != 0,
            should_clear: flags & FLAG_SHOULD_CLEAR != 0,
            deletion_record: flags & FLAG_DELETION != 0,
        })
    }
}

/// One record of a delta iteration. Removals carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaItem {
    pub state: DeltaIteratorState,
    pub entry: TableEntry,
}

/// Single-consumer iterator over the records of a log window.
pub struct TableEntryDeltaIterator {
    segment: Arc<dyn SegmentAccess>,
    serializer: EntrySerializer,
    position: u64,
    end: u64,
    should_clear: bool,
    read_size: usize,
    fetch_timeout: Duration,
    pending: VecDeque<DeltaItem>,
}

impl TableEntryDeltaIterator {
    pub(crate) fn new(
        segment: Arc<dyn SegmentAccess>,
        from_position: u64,
        end: u64,
        should_clear: bool,
        read_size: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            segment,
            serializer: EntrySerializer::new(),
            position: from_position,
            end,
            should_clear,
            read_size,
            fetch_timeout,
            pending: VecDeque::new(),
        }
    }

    /// True once every record of the window has been fetched.
    pub fn end_of_segment(&self) -> bool {
        self.position >= self.end
    }

    /// Offset the next fetch reads from.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The next record of the window, or `None` once it is exhausted.
    pub fn next(&mut self) -> TableResult<Option<DeltaItem>> {
        if self.pending.is_empty() && !self.end_of_segment() {
            self.fetch()?;
        }
        Ok(self.pending.pop_front())
    }

    /// Read one chunk and queue every record starting inside the window.
    fn fetch(&mut self) -> TableResult<()> {
        let timer = TimeoutTimer::new(self.fetch_timeout);
        timer.check("delta_iterator")?;
        let data = self.segment.read(self.position, self.read_size)?;
        let records = self.serializer.read_records(&data, self.position)?;
        if records.is_empty() {
            return Err(TableError::data_format(
                self.position,
                format!("no whole record within {} bytes", data.len()),
            ));
        }

        for record in records {
            if record.version >= self.end {
                break;
            }
            let next = record.next_offset();
            let deletion_record = record.is_deletion();
            self.position = next;
            self.pending.push_back(DeltaItem {
                state: DeltaIteratorState {
                    from_position: next,
                    reached_end: next >= self.end,
                    should_clear: self.should_clear,
                    deletion_record,
                },
                entry: TableEntry::versioned(record.key, record.value.unwrap_or_default(), record.version),
            });
        }
        Ok(())
    }
}
