//! SegTable Core: key-value tables over append-only log segments
//!
//! Each table is one continuously appended segment. Records are grouped into
//! buckets by key hash and chained newest-first through backpointers stored
//! in the records themselves, so any key can be found by walking its bucket
//! from the head offset.
//!
//! # Architecture
//!
//! - **Read path**: resolve the bucket head (tail cache, then durable index), walk the chain
//! - **Write path**: per-hash locks, version checks, all-or-nothing append, tail cache update
//! - **Writer**: background indexing into the durable index and compaction of the log head
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use segtable_core::{Config, ContainerTableExtension, SegmentContainer, TableEntry};
//!
//! let container = Arc::new(SegmentContainer::open("/tmp/segtable", 0)?);
//! let tables = ContainerTableExtension::new(container, Config::default())?;
//! let timeout = Duration::from_secs(5);
//!
//! tables.create_segment("users", timeout)?;
//! tables.put("users", vec![TableEntry::unversioned("alice", "admin")], timeout)?;
//! let found = tables.get("users", &[b"alice".to_vec()], timeout)?;
//! assert_eq!(found[0].as_ref().map(|e| e.value.as_slice()), Some(&b"admin"[..]));
//! # Ok::<(), segtable_core::TableError>(())
//! ```

pub mod batch;
pub mod bucket_reader;
pub mod config;
pub mod delta_iterator;
pub mod entry;
pub mod error;
pub mod extension;
pub mod hasher;
pub mod iterator;
pub mod key_index;
pub mod locks;
pub mod serializer;
pub mod storage;
pub mod timer;
pub mod writer;

// Re-export key types for convenience
pub use batch::TableKeyBatch;
pub use bucket_reader::{BucketItem, TableBucketReader};
pub use config::Config;
pub use delta_iterator::{DeltaItem, DeltaIteratorState, TableEntryDeltaIterator};
pub use entry::{KeyVersion, TableEntry, TableKey};
pub use error::{TableError, TableResult};
pub use extension::ContainerTableExtension;
pub use hasher::{KeyHash, KeyHasher};
pub use iterator::{IteratorItem, IteratorState, TableIterator};
pub use key_index::ContainerKeyIndex;
pub use serializer::{EntrySerializer, MAX_SERIALIZATION_LENGTH};
pub use storage::{DirectSegment, SegmentAccess, SegmentAttributes, SegmentContainer, SegmentInfo};
pub use timer::TimeoutTimer;
pub use writer::{WriterHandle, WriterStats, WriterTableProcessor};
