//! Background indexing and compaction of table segments
//!
//! A [`WriterTableProcessor`] owns the background work for one table segment:
//!
//! 1. **Indexing** folds records appended after the index offset into the
//!    durable hash index, advances the offset and lets the key index drop the
//!    cached heads it no longer needs.
//! 2. **Compaction** runs when too few indexed records are still live. It
//!    re-appends each live record from the head of the log (conditionally, so
//!    a concurrent update wins) and truncates the scanned range.
//!
//! [`start_writer`] drives one processor per table segment on a background
//! thread at the configured cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::batch::TableKeyBatch;
use crate::bucket_reader::TableBucketReader;
use crate::config::Config;
use crate::entry::{TableEntry, TableKey};
use crate::error::{TableError, TableResult};
use crate::extension::append_update;
use crate::hasher::{KeyHash, KeyHasher};
use crate::key_index::ContainerKeyIndex;
use crate::serializer::{EntrySerializer, LogRecord};
use crate::storage::{scan_records, IndexUpdate, SegmentAccess, SegmentContainer, SegmentInfo};
use crate::timer::TimeoutTimer;

/// Longest uninterrupted sleep of the writer thread, so shutdown stays prompt.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Counters shared by the processors of one writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    indexed_bytes: AtomicU64,
    indexed_records: AtomicU64,
    compacted_bytes: AtomicU64,
    relocated_records: AtomicU64,
    total_cycles: AtomicU64,
    failed_steps: AtomicU64,
}

impl WriterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log bytes folded into durable indexes.
    pub fn indexed_bytes(&self) -> u64 {
        self.indexed_bytes.load(Ordering::Relaxed)
    }

    pub fn indexed_records(&self) -> u64 {
        self.indexed_records.load(Ordering::Relaxed)
    }

    /// Log bytes truncated away by compaction.
    pub fn compacted_bytes(&self) -> u64 {
        self.compacted_bytes.load(Ordering::Relaxed)
    }

    /// Live records re-appended by compaction.
    pub fn relocated_records(&self) -> u64 {
        self.relocated_records.load(Ordering::Relaxed)
    }

    /// Writer thread cycles completed.
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    pub fn failed_steps(&self) -> u64 {
        self.failed_steps.load(Ordering::Relaxed)
    }
}

/// Background indexer and compactor of one table segment.
pub struct WriterTableProcessor {
    segment: Arc<dyn SegmentAccess>,
    key_index: Arc<ContainerKeyIndex>,
    hasher: KeyHasher,
    serializer: EntrySerializer,
    config: Config,
    stats: Arc<WriterStats>,
    /// Serializes index and compaction steps
    step: Mutex<()>,
    closed: AtomicBool,
}

impl WriterTableProcessor {
    pub(crate) fn new(
        segment: Arc<dyn SegmentAccess>,
        key_index: Arc<ContainerKeyIndex>,
        hasher: KeyHasher,
        config: Config,
        stats: Arc<WriterStats>,
    ) -> Self {
        Self {
            segment,
            key_index,
            hasher,
            serializer: EntrySerializer::new(),
            config,
            stats,
            step: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment.segment_id()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Fold up to `max_compaction_size` unindexed bytes into the durable
    /// index. Returns the number of bytes indexed.
    pub fn index_step(&self) -> TableResult<u64> {
        let _step = self.step.lock();
        self.ensure_open()?;
        let timer = TimeoutTimer::new(self.config.default_timeout);
        let info = self.segment.info()?;
        let index_offset = table_index_offset(&info)?;
        if index_offset >= info.length {
            return Ok(0);
        }

        let to = info.length.min(index_offset + self.config.max_compaction_size as u64);
        let mut records: Vec<LogRecord> = Vec::new();
        let end = scan_records(self.segment.as_ref(), index_offset, to, self.config.delta_read_size, &timer, |record| {
            records.push(record);
            Ok(())
        })?;
        if records.is_empty() {
            return Ok(0);
        }

        let reader = TableBucketReader::<TableKey>::new(self.segment.as_ref());
        let mut newest: HashMap<KeyHash, u64> = HashMap::new();
        let mut entry_count_delta = 0i64;
        for record in &records {
            let existed_before = match record.backpointer {
                None => false,
                Some(previous) => match reader.find(&record.key, previous, &timer) {
                    Ok(found) => found.is_some(),
                    // Compacted away: counted as new, which compaction accounts for.
                    Err(e) if e.is_truncated() => false,
                    Err(e) => return Err(e),
                },
            };
            let exists_after = !record.is_deletion();
            entry_count_delta += i64::from(exists_after) - i64::from(existed_before);

            let head = newest.entry(self.hasher.hash(&record.key)).or_insert(record.version);
            if *head < record.version {
                *head = record.version;
            }
        }

        // Compaction may already have published a newer head for some buckets.
        let hashes: Vec<KeyHash> = newest.keys().copied().collect();
        let durable = self.segment.index_get(&hashes)?;
        let buckets = hashes
            .iter()
            .zip(durable)
            .map(|(hash, existing)| (*hash, Some(existing.map_or(newest[hash], |e| e.max(newest[hash])))))
            .collect();

        self.segment.index_update(&IndexUpdate {
            buckets,
            index_offset: Some(end),
            entry_count_delta,
            total_entry_count_delta: records.len() as i64,
        })?;
        self.key_index.notify_durable_offset_advanced(self.segment.segment_id(), Some(end));

        let indexed = end - index_offset;
        self.stats.indexed_bytes.fetch_add(indexed, Ordering::Relaxed);
        self.stats.indexed_records.fetch_add(records.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            "{} indexed [{}, {}): {} records, entry count delta {}",
            self.trace_id(&info),
            index_offset,
            end,
            records.len(),
            entry_count_delta
        );
        Ok(indexed)
    }

    /// Compact the head of the log if utilization is below the threshold.
    /// Returns the number of bytes truncated.
    pub fn compact_step(&self) -> TableResult<u64> {
        let _step = self.step.lock();
        self.ensure_open()?;
        let timer = TimeoutTimer::new(self.config.default_timeout);
        let info = self.segment.info()?;
        let index_offset = table_index_offset(&info)?;
        if !needs_compaction(&info) {
            return Ok(0);
        }

        let to = index_offset.min(info.start_offset + self.config.max_compaction_size as u64);
        if to <= info.start_offset {
            return Ok(0);
        }
        let mut records: Vec<LogRecord> = Vec::new();
        let compacted_until = scan_records(
            self.segment.as_ref(),
            info.start_offset,
            to,
            self.config.delta_read_size,
            &timer,
            |record| {
                records.push(record);
                Ok(())
            },
        )?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut relocated = 0u64;
        let mut scanned_hashes: Vec<KeyHash> = Vec::with_capacity(records.len());
        for record in &records {
            let hash = self.hasher.hash(&record.key);
            scanned_hashes.push(hash);
            let Some(value) = record.value.as_ref() else {
                continue;
            };
            if self.relocate(&record.key, value, record.version, hash, &timer)? {
                relocated += 1;
            }
        }
        scanned_hashes.sort_unstable();
        scanned_hashes.dedup();

        // Buckets with nothing left at or above the compacted range are dead;
        // the others get their (possibly relocated) head published.
        let resolved = self.key_index.resolve(self.segment.as_ref(), &scanned_hashes, &timer)?;
        let durable = self.segment.index_get(&scanned_hashes)?;
        let buckets: Vec<(KeyHash, Option<u64>)> = scanned_hashes
            .iter()
            .zip(resolved.into_iter().zip(durable))
            .filter_map(|(hash, (head, durable))| match head {
                Some(head) if head >= compacted_until => match durable {
                    Some(d) if d >= compacted_until => None,
                    _ => Some((*hash, Some(head))),
                },
                _ => durable.map(|_| (*hash, None)),
            })
            .collect();

        self.segment.index_update(&IndexUpdate {
            buckets,
            index_offset: None,
            // Relocated records are counted again when they are indexed.
            entry_count_delta: -(relocated as i64),
            total_entry_count_delta: -(records.len() as i64),
        })?;
        self.segment.truncate(compacted_until)?;

        let compacted = compacted_until - info.start_offset;
        self.stats.compacted_bytes.fetch_add(compacted, Ordering::Relaxed);
        self.stats.relocated_records.fetch_add(relocated, Ordering::Relaxed);
        tracing::debug!(
            "{} compacted [{}, {}): {} records scanned, {} relocated",
            self.trace_id(&info),
            info.start_offset,
            compacted_until,
            records.len(),
            relocated
        );
        Ok(compacted)
    }

    /// Re-append a record if it is still the live version of its key.
    fn relocate(&self, key: &[u8], value: &[u8], version: u64, hash: KeyHash, timer: &TimeoutTimer) -> TableResult<bool> {
        let entries = [TableEntry::versioned(key, value, version)];
        let mut batch = TableKeyBatch::update();
        batch.add(entries[0].key.clone(), hash, self.serializer.update_length(&entries[0])?);

        let segment = self.segment.as_ref();
        let serializer = &self.serializer;
        match self.key_index.update(
            segment,
            &batch,
            |links| append_update(segment, serializer, &entries, links, None),
            timer,
        ) {
            Ok(_) => Ok(true),
            Err(TableError::BadVersion { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stop processing and drop the key index's cached state for the segment.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.key_index.notify_durable_offset_advanced(self.segment.segment_id(), None);
        }
    }

    fn ensure_open(&self) -> TableResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TableError::Closed);
        }
        Ok(())
    }

    fn trace_id(&self, info: &SegmentInfo) -> String {
        format!("TableWriter[{}:{}]", self.key_index.container_id(), info.name)
    }
}

fn table_index_offset(info: &SegmentInfo) -> TableResult<u64> {
    info.attributes
        .index_offset
        .ok_or_else(|| TableError::NotATableSegment { segment: info.name.clone() })
}

/// True if fewer than `min_utilization` percent of the indexed records are live.
fn needs_compaction(info: &SegmentInfo) -> bool {
    let attributes = &info.attributes;
    if attributes.total_entry_count == 0 {
        return false;
    }
    let utilization = attributes.entry_count.saturating_mul(100) / attributes.total_entry_count;
    utilization < u64::from(attributes.min_utilization)
}

/// Handle to a running writer thread. Dropping it stops the thread.
pub struct WriterHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<WriterStats>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WriterHandle {
    /// Request graceful shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the background writer for every table segment of `container`.
///
/// Each cycle, for every table segment:
/// 1. index unindexed bytes (repeatedly, until caught up)
/// 2. compact once if utilization is low
///
/// Processors of deleted segments are closed. A final indexing pass runs on
/// shutdown.
pub fn start_writer(
    container: Arc<SegmentContainer>,
    key_index: Arc<ContainerKeyIndex>,
    hasher: KeyHasher,
    config: Config,
) -> TableResult<WriterHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(WriterStats::new());
    let thread_shutdown = Arc::clone(&shutdown);
    let thread_stats = Arc::clone(&stats);
    let path = container.path().to_path_buf();
    let container_id = container.container_id();
    let config_cadence = config.writer_cadence;

    let thread = thread::Builder::new()
        .name(format!("segtable-writer-{}", container_id))
        .spawn(move || {
            let mut writer = WriterLoop { container, key_index, hasher, config, stats: thread_stats, processors: HashMap::new() };
            writer.run(&thread_shutdown);
        })
        .map_err(|e| TableError::io(path, e))?;

    tracing::info!(container = container_id, cadence = ?config_cadence, "writer started");
    Ok(WriterHandle { shutdown, stats, thread: Some(thread) })
}

struct WriterLoop {
    container: Arc<SegmentContainer>,
    key_index: Arc<ContainerKeyIndex>,
    hasher: KeyHasher,
    config: Config,
    stats: Arc<WriterStats>,
    processors: HashMap<String, WriterTableProcessor>,
}

impl WriterLoop {
    fn run(&mut self, shutdown: &AtomicBool) {
        loop {
            let wake_time = Instant::now() + self.config.writer_cadence;
            while Instant::now() < wake_time {
                if shutdown.load(Ordering::Acquire) {
                    self.finish();
                    return;
                }
                thread::sleep(SLEEP_SLICE.min(wake_time.saturating_duration_since(Instant::now())));
            }
            if shutdown.load(Ordering::Acquire) || self.key_index.is_closed() {
                self.finish();
                return;
            }
            self.cycle(true);
        }
    }

    fn cycle(&mut self, compact: bool) {
        self.refresh_processors();
        for (name, processor) in &self.processors {
            let result = drain_index(processor).and_then(|_| if compact { processor.compact_step().map(|_| ()) } else { Ok(()) });
            if let Err(e) = result {
                self.stats.failed_steps.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(segment = %name, "writer step failed: {}", e);
            }
        }
        self.stats.total_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Create processors for new table segments, close those of deleted ones.
    fn refresh_processors(&mut self) {
        let names = self.container.segment_names();
        self.processors.retain(|name, processor| {
            let live = names.contains(name);
            if !live {
                processor.close();
            }
            live
        });

        for name in names {
            if self.processors.contains_key(&name) {
                continue;
            }
            let Ok(segment) = self.container.for_segment(&name) else {
                continue;
            };
            let is_table = segment.info().map_or(false, |info| info.attributes.is_table_segment());
            if !is_table {
                continue;
            }
            let processor = WriterTableProcessor::new(
                segment,
                Arc::clone(&self.key_index),
                self.hasher,
                self.config.clone(),
                Arc::clone(&self.stats),
            );
            self.processors.insert(name, processor);
        }
    }

    fn finish(&mut self) {
        if !self.key_index.is_closed() {
            self.cycle(false);
        }
        self.processors.clear();
        tracing::info!("writer stopped");
    }
}

/// Index until the segment is caught up.
fn drain_index(processor: &WriterTableProcessor) -> TableResult<()> {
    while processor.index_step()? > 0 {}
    Ok(())
}
