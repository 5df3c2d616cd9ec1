//! Table segment API of one container
//!
//! [`ContainerTableExtension`] is the public surface: create and delete
//! tables, conditional put and remove, batched get, and iteration. Every
//! mutation builds a [`TableKeyBatch`], resolves the table's segment and hands
//! the batch to the [`ContainerKeyIndex`] with a commit callback that
//! serializes the batch and appends it.
//!
//! **Read path**: hash -> head (tail cache, then durable index) -> chain walk
//! **Write path**: batch -> per-hash locks -> version checks -> append -> tail cache
//! **Background**: optional writer thread indexes and compacts every table

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::batch::TableKeyBatch;
use crate::config::Config;
use crate::delta_iterator::TableEntryDeltaIterator;
use crate::entry::{TableEntry, TableKey};
use crate::error::{TableError, TableResult};
use crate::hasher::KeyHasher;
use crate::iterator::{IteratorState, TableIterator};
use crate::key_index::{BatchLinks, ContainerKeyIndex};
use crate::serializer::EntrySerializer;
use crate::storage::{DirectSegment, SegmentAccess, SegmentAttributes, SegmentContainer};
use crate::timer::TimeoutTimer;
use crate::writer::{start_writer, WriterHandle, WriterStats, WriterTableProcessor};

/// Table segments of one container.
///
/// All methods take `&self` and may be called from many threads. Writes to
/// the same key hash serialize; everything else runs concurrently.
pub struct ContainerTableExtension {
    container: Arc<SegmentContainer>,
    key_index: Arc<ContainerKeyIndex>,
    hasher: KeyHasher,
    serializer: EntrySerializer,
    config: Config,
    writer: Mutex<Option<WriterHandle>>,
    closed: AtomicBool,
    trace_id: String,
}

impl ContainerTableExtension {
    /// Table extension over `container` with the default SHA-256 key hasher.
    pub fn new(container: Arc<SegmentContainer>, config: Config) -> TableResult<Self> {
        Self::with_hasher(container, config, KeyHasher::default())
    }

    /// Table extension with a custom key hasher.
    pub fn with_hasher(container: Arc<SegmentContainer>, config: Config, hasher: KeyHasher) -> TableResult<Self> {
        config.validate().map_err(|reason| TableError::InvalidConfig { reason })?;
        let container_id = container.container_id();
        Ok(Self {
            key_index: Arc::new(ContainerKeyIndex::new(container_id, hasher, &config)),
            container,
            hasher,
            serializer: EntrySerializer::new(),
            config,
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
            trace_id: format!("TableExtension[{}]", container_id),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the writer and release the key index. Later calls fail with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_writer();
        self.key_index.close();
        tracing::info!("{}: closed", self.trace_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start background indexing and compaction of every table segment.
    pub fn start_writer(&self) -> TableResult<()> {
        self.ensure_open()?;
        let mut writer = self.writer.lock();
        if writer.is_none() {
            *writer = Some(start_writer(
                Arc::clone(&self.container),
                Arc::clone(&self.key_index),
                self.hasher,
                self.config.clone(),
            )?);
        }
        Ok(())
    }

    /// Stop the background writer, if running.
    pub fn stop_writer(&self) {
        if let Some(handle) = self.writer.lock().take() {
            handle.shutdown();
        }
    }

    /// Create an empty table segment.
    pub fn create_segment(&self, segment_name: &str, _timeout: Duration) -> TableResult<()> {
        self.ensure_open()?;
        self.log_request("createSegment", format_args!("{}", segment_name));
        self.container
            .create_segment(segment_name, SegmentAttributes::table(self.config.min_utilization))?;
        tracing::info!("{}: created table segment '{}'", self.trace_id, segment_name);
        Ok(())
    }

    /// Delete a table segment. With `must_be_empty`, fails with `NotEmpty`
    /// unless the table has no live entries; no update can slip in between
    /// the check and the deletion.
    pub fn delete_segment(&self, segment_name: &str, must_be_empty: bool, timeout: Duration) -> TableResult<()> {
        self.ensure_open()?;
        self.log_request("deleteSegment", format_args!("{} must_be_empty={}", segment_name, must_be_empty));
        let timer = TimeoutTimer::new(timeout);
        let segment = self.table_segment(segment_name)?;
        if must_be_empty {
            self.key_index
                .execute_if_empty(&*segment, || self.container.delete_segment(segment_name), &timer)?;
        } else {
            self.container.delete_segment(segment_name)?;
        }
        self.key_index.remove_segment(segment.segment_id());
        tracing::info!("{}: deleted table segment '{}'", self.trace_id, segment_name);
        Ok(())
    }

    /// Not supported for table segments.
    pub fn merge(&self, _target_segment: &str, _source_segment: &str, _timeout: Duration) -> TableResult<()> {
        self.ensure_open()?;
        Err(TableError::Unsupported { operation: "merge" })
    }

    /// Not supported for table segments.
    pub fn seal(&self, _segment_name: &str, _timeout: Duration) -> TableResult<()> {
        self.ensure_open()?;
        Err(TableError::Unsupported { operation: "seal" })
    }

    /// Insert or update entries. Entries with a version are conditional; if
    /// any condition fails nothing is written. Returns the new version of
    /// each entry, in input order.
    pub fn put(&self, segment_name: &str, entries: Vec<TableEntry>, timeout: Duration) -> TableResult<Vec<u64>> {
        self.put_internal(segment_name, entries, None, timeout)
    }

    /// Like [`put`](Self::put), but only if the segment length is exactly
    /// `table_segment_offset` (`BadOffset` otherwise).
    pub fn put_at_offset(
        &self,
        segment_name: &str,
        entries: Vec<TableEntry>,
        table_segment_offset: u64,
        timeout: Duration,
    ) -> TableResult<Vec<u64>> {
        self.put_internal(segment_name, entries, Some(table_segment_offset), timeout)
    }

    fn put_internal(
        &self,
        segment_name: &str,
        entries: Vec<TableEntry>,
        table_segment_offset: Option<u64>,
        timeout: Duration,
    ) -> TableResult<Vec<u64>> {
        self.ensure_open()?;
        let timer = TimeoutTimer::new(timeout);
        let mut batch = TableKeyBatch::update();
        for entry in &entries {
            let length = self.serializer.update_length(entry)?;
            batch.add(entry.key.clone(), self.hasher.hash(&entry.key.key), length);
        }
        self.log_batch("put", segment_name, &batch, table_segment_offset);
        batch.check_length(self.config.max_batch_size)?;

        let segment = self.table_segment(segment_name)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let serializer = &self.serializer;
        self.key_index.update(
            &*segment,
            &batch,
            |links| append_update(&*segment, serializer, &entries, links, table_segment_offset),
            &timer,
        )
    }

    /// Remove keys. Keys with a version are conditional; if any condition
    /// fails nothing is removed. Removing a missing key is not an error.
    pub fn remove(&self, segment_name: &str, keys: Vec<TableKey>, timeout: Duration) -> TableResult<()> {
        self.remove_internal(segment_name, keys, None, timeout)
    }

    /// Like [`remove`](Self::remove), but only if the segment length is
    /// exactly `table_segment_offset`.
    pub fn remove_at_offset(
        &self,
        segment_name: &str,
        keys: Vec<TableKey>,
        table_segment_offset: u64,
        timeout: Duration,
    ) -> TableResult<()> {
        self.remove_internal(segment_name, keys, Some(table_segment_offset), timeout)
    }

    fn remove_internal(
        &self,
        segment_name: &str,
        keys: Vec<TableKey>,
        table_segment_offset: Option<u64>,
        timeout: Duration,
    ) -> TableResult<()> {
        self.ensure_open()?;
        let timer = TimeoutTimer::new(timeout);
        let mut batch = TableKeyBatch::removal();
        for key in &keys {
            let length = self.serializer.removal_length(key)?;
            batch.add(key.clone(), self.hasher.hash(&key.key), length);
        }
        self.log_batch("remove", segment_name, &batch, table_segment_offset);
        batch.check_length(self.config.max_batch_size)?;

        let segment = self.table_segment(segment_name)?;
        if batch.is_empty() {
            return Ok(());
        }
        let serializer = &self.serializer;
        self.key_index.update(
            &*segment,
            &batch,
            |links| {
                segment.append(table_segment_offset, &mut |base| {
                    serializer.serialize_removal(&keys, &links.backpointers(base))
                })
            },
            &timer,
        )?;
        Ok(())
    }

    /// Current entries for `keys`, in input order; `None` for keys that do
    /// not exist or were removed.
    pub fn get(&self, segment_name: &str, keys: &[Vec<u8>], timeout: Duration) -> TableResult<Vec<Option<TableEntry>>> {
        self.ensure_open()?;
        self.log_request("get", format_args!("{} count={}", segment_name, keys.len()));
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let timer = TimeoutTimer::new(timeout);
        let segment = self.table_segment(segment_name)?;
        keys.iter()
            .map(|key| {
                self.key_index
                    .find::<TableEntry>(&*segment, key, self.hasher.hash(key), &timer)
            })
            .collect()
    }

    /// Iterator over the live keys of a table, resuming after `state` if given.
    pub fn key_iterator(
        &self,
        segment_name: &str,
        state: Option<&[u8]>,
        fetch_timeout: Duration,
    ) -> TableResult<TableIterator<TableKey>> {
        self.log_request("keyIterator", format_args!("{}", segment_name));
        self.new_iterator(segment_name, state, fetch_timeout)
    }

    /// Iterator over the live entries of a table, resuming after `state` if given.
    pub fn entry_iterator(
        &self,
        segment_name: &str,
        state: Option<&[u8]>,
        fetch_timeout: Duration,
    ) -> TableResult<TableIterator<TableEntry>> {
        self.log_request("entryIterator", format_args!("{}", segment_name));
        self.new_iterator(segment_name, state, fetch_timeout)
    }

    fn new_iterator<T: crate::bucket_reader::BucketItem>(
        &self,
        segment_name: &str,
        state: Option<&[u8]>,
        fetch_timeout: Duration,
    ) -> TableResult<TableIterator<T>> {
        self.ensure_open()?;
        let state = state.map(IteratorState::from_bytes).transpose()?;
        let segment: Arc<dyn SegmentAccess> = self.table_segment(segment_name)?;
        Ok(TableIterator::new(
            segment,
            Arc::clone(&self.key_index),
            state,
            self.config.iterator_fetch_buckets,
            fetch_timeout,
        ))
    }

    /// Log-ordered iterator over the records in `[from_position, length)`,
    /// where `length` is the segment length now. A start below the
    /// truncation point restarts at the first retained record and marks every
    /// item `should_clear`.
    pub fn entry_delta_iterator(
        &self,
        segment_name: &str,
        from_position: u64,
        fetch_timeout: Duration,
    ) -> TableResult<TableEntryDeltaIterator> {
        self.ensure_open()?;
        self.log_request("entryDeltaIterator", format_args!("{} from={}", segment_name, from_position));
        let segment = self.table_segment(segment_name)?;
        let info = segment.info()?;
        if from_position > info.length {
            return Err(TableError::data_format(
                from_position,
                format!("delta start beyond segment length {}", info.length),
            ));
        }
        let should_clear = from_position < info.start_offset;
        let start = from_position.max(info.start_offset);
        Ok(TableEntryDeltaIterator::new(
            segment,
            start,
            info.length,
            should_clear,
            self.config.delta_read_size,
            fetch_timeout,
        ))
    }

    /// Background indexer and compactor for one table segment.
    pub fn create_writer_processor(&self, segment_name: &str) -> TableResult<WriterTableProcessor> {
        self.ensure_open()?;
        let segment = self.table_segment(segment_name)?;
        Ok(WriterTableProcessor::new(
            segment,
            Arc::clone(&self.key_index),
            self.hasher,
            self.config.clone(),
            Arc::new(WriterStats::new()),
        ))
    }

    /// Names of all table segments.
    pub fn table_segment_names(&self) -> TableResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .container
            .segment_names()
            .into_iter()
            .filter(|name| self.table_segment(name).is_ok())
            .collect())
    }

    /// Open handle to a table segment.
    fn table_segment(&self, segment_name: &str) -> TableResult<Arc<DirectSegment>> {
        let segment = self.container.for_segment(segment_name)?;
        if !segment.info()?.attributes.is_table_segment() {
            return Err(TableError::NotATableSegment { segment: segment_name.to_string() });
        }
        Ok(segment)
    }

    fn ensure_open(&self) -> TableResult<()> {
        if self.is_closed() {
            return Err(TableError::Closed);
        }
        Ok(())
    }

    fn log_batch(&self, request: &str, segment_name: &str, batch: &TableKeyBatch, offset: Option<u64>) {
        self.log_request(
            request,
            format_args!(
                "{} conditional={} offset={:?} removal={} count={} length={}",
                segment_name,
                batch.is_conditional(),
                offset,
                batch.is_removal(),
                batch.len(),
                batch.length()
            ),
        );
    }

    fn log_request(&self, request: &str, args: fmt::Arguments<'_>) {
        tracing::debug!("{}: {} {}", self.trace_id, request, args);
    }
}

impl Drop for ContainerTableExtension {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialize `entries` against their bucket links and append them.
pub(crate) fn append_update(
    segment: &dyn SegmentAccess,
    serializer: &EntrySerializer,
    entries: &[TableEntry],
    links: &BatchLinks,
    expected_offset: Option<u64>,
) -> TableResult<u64> {
    segment.append(expected_offset, &mut |base| serializer.serialize_update(entries, &links.backpointers(base)))
}
