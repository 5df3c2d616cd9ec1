//! File-backed append-only segment
//!
//! Each segment owns two files in the container directory:
//! - `<hex name>.seg`: the record bytes, appended and durably synced
//! - `<hex name>.attr`: snapshot of start offset, attributes and the durable
//!   hash index, replaced with the atomic rename pattern:
//!   1. write `<hex name>.attr.tmp`
//!   2. durable_sync the temp file
//!   3. rename over `<hex name>.attr` (atomic on POSIX)
//!   4. durable_sync the directory

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use super::sync::{durable_sync, read_exact_at, sync_dir};
use super::{AppendBuilder, IndexUpdate, SegmentAccess, SegmentAttributes, SegmentInfo};
use crate::error::{TableError, TableResult};
use crate::hasher::{KeyHash, HASH_LENGTH};

/// Magic bytes of an attribute snapshot: "SGTA"
const ATTR_MAGIC: [u8; 4] = [0x53, 0x47, 0x54, 0x41];
const ATTR_VERSION: u8 = 1;
const ATTR_FIXED_SIZE: usize = 48;
const ATTR_BUCKET_SIZE: usize = HASH_LENGTH + 8;
const FLAG_HAS_INDEX_OFFSET: u8 = 0x01;

pub(crate) const DATA_EXTENSION: &str = "seg";
const ATTR_EXTENSION: &str = "attr";

#[derive(Debug, Default)]
struct SegmentState {
    start_offset: u64,
    length: u64,
    attributes: SegmentAttributes,
    index: BTreeMap<KeyHash, u64>,
}

/// A named, append-only byte log with an attribute map and a durable hash index.
///
/// Appends serialize through the writer Mutex. Reads are positional and take
/// no file lock; they never see bytes beyond the committed length, so a record
/// is visible whole or not at all.
pub struct DirectSegment {
    id: u64,
    name: String,
    data_path: PathBuf,
    attr_path: PathBuf,
    writer: Mutex<File>,
    reader: File,
    state: RwLock<SegmentState>,
    deleted: AtomicBool,
}

impl DirectSegment {
    /// Create a new segment in `dir`. Fails if the files already exist.
    pub(crate) fn create(id: u64, dir: &Path, name: &str, attributes: SegmentAttributes) -> TableResult<Self> {
        let (data_path, attr_path) = segment_paths(dir, name);
        let writer = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| TableError::io(&data_path, e))?;
        let reader = File::open(&data_path).map_err(|e| TableError::io(&data_path, e))?;

        let state = SegmentState { attributes, ..SegmentState::default() };
        write_snapshot(&attr_path, &state)?;
        sync_dir(dir).map_err(|e| TableError::io(dir, e))?;

        Ok(Self::assemble(id, name, data_path, attr_path, writer, reader, state))
    }

    /// Open an existing segment, restoring its length and attribute snapshot.
    pub(crate) fn open(id: u64, dir: &Path, name: &str) -> TableResult<Self> {
        let (data_path, attr_path) = segment_paths(dir, name);
        let writer = OpenOptions::new()
            .append(true)
            .open(&data_path)
            .map_err(|e| TableError::io(&data_path, e))?;
        let reader = File::open(&data_path).map_err(|e| TableError::io(&data_path, e))?;
        let length = writer.metadata().map_err(|e| TableError::io(&data_path, e))?.len();

        let mut state = if attr_path.exists() {
            read_snapshot(&attr_path)?
        } else {
            SegmentState::default()
        };
        state.length = length;
        if state.start_offset > length {
            return Err(TableError::data_format(
                state.start_offset,
                format!("start offset beyond segment length {} in {}", length, attr_path.display()),
            ));
        }

        Ok(Self::assemble(id, name, data_path, attr_path, writer, reader, state))
    }

    fn assemble(
        id: u64,
        name: &str,
        data_path: PathBuf,
        attr_path: PathBuf,
        writer: File,
        reader: File,
        state: SegmentState,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            data_path,
            attr_path,
            writer: Mutex::new(writer),
            reader,
            state: RwLock::new(state),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark deleted and remove both files. Open handles fail with `NotFound`.
    pub(crate) fn delete_files(&self) -> TableResult<()> {
        // Hold the writer so no append is in flight while the files go away.
        let _writer = self.writer.lock();
        self.deleted.store(true, Ordering::Release);
        fs::remove_file(&self.data_path).map_err(|e| TableError::io(&self.data_path, e))?;
        if self.attr_path.exists() {
            fs::remove_file(&self.attr_path).map_err(|e| TableError::io(&self.attr_path, e))?;
        }
        Ok(())
    }

    fn ensure_live(&self) -> TableResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(TableError::NotFound { segment: self.name.clone() });
        }
        Ok(())
    }
}

impl SegmentAccess for DirectSegment {
    fn segment_id(&self) -> u64 {
        self.id
    }

    fn info(&self) -> TableResult<SegmentInfo> {
        self.ensure_live()?;
        let state = self.state.read();
        Ok(SegmentInfo {
            name: self.name.clone(),
            start_offset: state.start_offset,
            length: state.length,
            attributes: state.attributes,
        })
    }

    fn read(&self, offset: u64, max_length: usize) -> TableResult<Vec<u8>> {
        self.ensure_live()?;
        let (start_offset, length) = {
            let state = self.state.read();
            (state.start_offset, state.length)
        };
        if offset < start_offset {
            return Err(TableError::Truncated { offset, start_offset });
        }
        if offset > length {
            return Err(TableError::data_format(
                offset,
                format!("read beyond end of segment '{}' (length {})", self.name, length),
            ));
        }

        let to_read = (length - offset).min(max_length as u64) as usize;
        let mut buffer = vec![0u8; to_read];
        if to_read > 0 {
            read_exact_at(&self.reader, &mut buffer, offset).map_err(|e| TableError::io(&self.data_path, e))?;
        }
        Ok(buffer)
    }

    fn append(&self, expected_offset: Option<u64>, build: &mut AppendBuilder<'_>) -> TableResult<u64> {
        self.ensure_live()?;
        let mut file = self.writer.lock();
        // Deletion takes the writer lock too; re-check under it.
        self.ensure_live()?;

        let base = self.state.read().length;
        if let Some(expected) = expected_offset {
            if expected != base {
                return Err(TableError::BadOffset { expected, actual: base });
            }
        }

        let bytes = build(base)?;
        if bytes.is_empty() {
            return Ok(base);
        }

        let written = file.write_all(&bytes).and_then(|_| durable_sync(&file));
        if let Err(e) = written {
            // Roll back any partial write so the next append starts at `base`.
            if let Err(rollback) = file.set_len(base) {
                tracing::warn!(segment = %self.name, "failed to roll back partial append: {}", rollback);
            }
            return Err(TableError::io(&self.data_path, e));
        }

        self.state.write().length = base + bytes.len() as u64;
        Ok(base)
    }

    fn truncate(&self, offset: u64) -> TableResult<()> {
        self.ensure_live()?;
        let mut state = self.state.write();
        if offset > state.length {
            return Err(TableError::data_format(
                offset,
                format!("cannot truncate beyond length {}", state.length),
            ));
        }
        if offset <= state.start_offset {
            return Ok(());
        }
        let previous = state.start_offset;
        state.start_offset = offset;
        if let Err(e) = write_snapshot(&self.attr_path, &state) {
            state.start_offset = previous;
            return Err(e);
        }
        Ok(())
    }

    fn index_get(&self, hashes: &[KeyHash]) -> TableResult<Vec<Option<u64>>> {
        self.ensure_live()?;
        let state = self.state.read();
        Ok(hashes.iter().map(|h| state.index.get(h).copied()).collect())
    }

    fn index_range(&self, from: KeyHash, limit: usize) -> TableResult<Vec<(KeyHash, u64)>> {
        self.ensure_live()?;
        let state = self.state.read();
        Ok(state.index.range(from..).take(limit).map(|(h, o)| (*h, *o)).collect())
    }

    fn index_update(&self, update: &IndexUpdate) -> TableResult<()> {
        self.ensure_live()?;
        let mut state = self.state.write();

        let mut next_index = state.index.clone();
        for (hash, head) in &update.buckets {
            match head {
                Some(offset) => next_index.insert(*hash, *offset),
                None => next_index.remove(hash),
            };
        }
        let mut attributes = state.attributes;
        if let Some(offset) = update.index_offset {
            attributes.index_offset = Some(offset);
        }
        attributes.entry_count = apply_delta(attributes.entry_count, update.entry_count_delta);
        attributes.total_entry_count = apply_delta(attributes.total_entry_count, update.total_entry_count_delta);

        let next = SegmentState {
            start_offset: state.start_offset,
            length: state.length,
            attributes,
            index: next_index,
        };
        write_snapshot(&self.attr_path, &next)?;
        *state = next;
        Ok(())
    }
}

impl std::fmt::Debug for DirectSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DirectSegment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("start_offset", &state.start_offset)
            .field("length", &state.length)
            .field("buckets", &state.index.len())
            .finish()
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// File paths for a segment: names are hex-encoded so any byte string is a valid name.
pub(crate) fn segment_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    let stem = hex::encode(name.as_bytes());
    (
        dir.join(format!("{}.{}", stem, DATA_EXTENSION)),
        dir.join(format!("{}.{}", stem, ATTR_EXTENSION)),
    )
}

fn encode_snapshot(state: &SegmentState) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ATTR_FIXED_SIZE + state.index.len() * ATTR_BUCKET_SIZE + 4);
    buf.extend_from_slice(&ATTR_MAGIC);
    buf.push(ATTR_VERSION);
    let attributes = &state.attributes;
    buf.push(if attributes.index_offset.is_some() { FLAG_HAS_INDEX_OFFSET } else { 0 });
    buf.push(attributes.min_utilization);
    buf.push(0);
    buf.extend_from_slice(&state.start_offset.to_le_bytes());
    buf.extend_from_slice(&attributes.index_offset.unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&attributes.entry_count.to_le_bytes());
    buf.extend_from_slice(&attributes.total_entry_count.to_le_bytes());
    buf.extend_from_slice(&(state.index.len() as u64).to_le_bytes());
    for (hash, offset) in &state.index {
        buf.extend_from_slice(&hash.to_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

fn decode_snapshot(data: &[u8]) -> TableResult<SegmentState> {
    let corrupt = |reason: &str| TableError::data_format(0, format!("attribute snapshot: {}", reason));

    if data.len() < ATTR_FIXED_SIZE + 4 {
        return Err(corrupt("too short"));
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32c::crc32c(body) != stored {
        return Err(corrupt("checksum mismatch"));
    }
    if body[0..4] != ATTR_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if body[4] != ATTR_VERSION {
        return Err(corrupt("unsupported version"));
    }

    let u64_at = |pos: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&body[pos..pos + 8]);
        u64::from_le_bytes(bytes)
    };
    let has_index_offset = body[5] & FLAG_HAS_INDEX_OFFSET != 0;
    let attributes = SegmentAttributes {
        index_offset: if has_index_offset { Some(u64_at(16)) } else { None },
        min_utilization: body[6],
        entry_count: u64_at(24),
        total_entry_count: u64_at(32),
    };
    let start_offset = u64_at(8);
    let bucket_count = u64_at(40) as usize;

    let buckets = &body[ATTR_FIXED_SIZE..];
    if buckets.len() != bucket_count.saturating_mul(ATTR_BUCKET_SIZE) {
        return Err(corrupt("bucket count does not match size"));
    }
    let mut index = BTreeMap::new();
    for chunk in buckets.chunks_exact(ATTR_BUCKET_SIZE) {
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&chunk[..HASH_LENGTH]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&chunk[HASH_LENGTH..]);
        index.insert(KeyHash::from_bytes(hash), u64::from_le_bytes(offset));
    }

    Ok(SegmentState { start_offset, length: 0, attributes, index })
}

fn write_snapshot(path: &Path, state: &SegmentState) -> TableResult<()> {
    let tmp_path = path.with_extension(format!("{}.tmp", ATTR_EXTENSION));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| TableError::io(&tmp_path, e))?;
        file.write_all(&encode_snapshot(state)).map_err(|e| TableError::io(&tmp_path, e))?;
        durable_sync(&file).map_err(|e| TableError::io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| TableError::io(path, e))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent).map_err(|e| TableError::io(parent, e))?;
    }
    Ok(())
}

fn read_snapshot(path: &Path) -> TableResult<SegmentState> {
    let data = fs::read(path).map_err(|e| TableError::io(path, e))?;
    decode_snapshot(&data)
}
