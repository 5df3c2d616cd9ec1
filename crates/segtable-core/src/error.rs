//! Error types for table segment operations
//!
//! All failures are represented by the [`TableError`] enum. Apart from
//! `Truncated`, which lookups retry once against a freshly resolved bucket
//! head, every error means the operation did not happen.

use std::path::PathBuf;

use thiserror::Error;

use crate::entry::KeyVersion;

/// Table segment error types with detailed context
#[derive(Debug, Error)]
pub enum TableError {
    /// The named segment does not exist (or was deleted)
    #[error("segment '{segment}' does not exist")]
    NotFound {
        /// Segment name
        segment: String,
    },

    /// A segment with this name already exists
    #[error("segment '{segment}' already exists")]
    SegmentExists {
        /// Segment name
        segment: String,
    },

    /// A conditional update found a different key version
    #[error("version mismatch for key {}: expected {expected}, found {actual}", display_key(.key))]
    BadVersion {
        /// Key whose condition failed
        key: Vec<u8>,
        /// Version the caller expected
        expected: KeyVersion,
        /// Version currently committed
        actual: KeyVersion,
    },

    /// A whole-segment conditional append found a different segment length
    #[error("bad segment offset: expected {expected}, segment length is {actual}")]
    BadOffset {
        /// Offset the caller expected to append at
        expected: u64,
        /// Actual segment length
        actual: u64,
    },

    /// Corrupt record, failed checksum or undecodable iterator state
    #[error("data format error at offset {offset}: {reason}")]
    DataFormat {
        /// Offset of the offending record (0 for cursors)
        offset: u64,
        /// Description of the problem
        reason: String,
    },

    /// Offset lies below the segment's truncation point
    #[error("offset {offset} is truncated (segment starts at {start_offset})")]
    Truncated {
        /// Requested offset
        offset: u64,
        /// Current start offset of the segment
        start_offset: u64,
    },

    /// The per-call deadline elapsed
    #[error("operation '{operation}' timed out")]
    Timeout {
        /// Name of the timed out operation
        operation: &'static str,
    },

    /// Called after the owning component was closed
    #[error("component is closed")]
    Closed,

    /// Record or batch exceeds its size limit
    #[error("length {length} exceeds maximum of {max} bytes")]
    CapacityExceeded {
        /// Requested length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Conditional delete found live entries
    #[error("table segment '{segment}' is not empty")]
    NotEmpty {
        /// Segment name
        segment: String,
    },

    /// Segment lacks the index offset attribute
    #[error("segment '{segment}' is not a table segment")]
    NotATableSegment {
        /// Segment name
        segment: String,
    },

    /// Operation not supported on table segments
    #[error("operation '{operation}' is not supported on table segments")]
    Unsupported {
        /// Name of the operation
        operation: &'static str,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What failed validation
        reason: String,
    },

    /// I/O operation failed
    #[error("I/O error{}: {source}", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl TableError {
    /// Attach a path to an I/O error.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TableError::Io { path: Some(path.into()), source }
    }

    pub(crate) fn data_format(offset: u64, reason: impl Into<String>) -> Self {
        TableError::DataFormat { offset, reason: reason.into() }
    }

    /// True for failures caused by reading below the truncation point.
    pub fn is_truncated(&self) -> bool {
        matches!(self, TableError::Truncated { .. })
    }
}

fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => format!("'{}'", s),
        Err(_) => format!("({} bytes)", key.len()),
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

/// Convert std::io::Error to TableError::Io
impl From<std::io::Error> for TableError {
    fn from(err: std::io::Error) -> Self {
        TableError::Io { path: None, source: err }
    }
}

/// Result type alias for table segment operations
pub type TableResult<T> = Result<T, TableError>;
