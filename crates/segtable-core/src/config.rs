//! Configuration management for table segments
//!
//! Provides presets for different hardware classes and validation of
//! custom configurations.

use std::time::Duration;

use crate::serializer::MAX_SERIALIZATION_LENGTH;

/// Table extension configuration with hardware-class presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum serialized length of one put/remove batch (bytes)
    pub max_batch_size: usize,
    /// Deadline applied by callers that do not pass their own timeout
    pub default_timeout: Duration,
    /// Bytes fetched per delta iterator read
    pub delta_read_size: usize,
    /// Background indexing/compaction cadence
    pub writer_cadence: Duration,
    /// Maximum bytes indexed or compacted in one writer step
    pub max_compaction_size: usize,
    /// Compaction trigger: compact when live entries fall below this percentage
    pub min_utilization: u8,
    /// Buckets examined per hash-ordered iterator step
    pub iterator_fetch_buckets: usize,
}

impl Config {
    /// Server-class: large batches, relaxed compaction
    pub fn server() -> Self {
        Self {
            max_batch_size: 32 * MAX_SERIALIZATION_LENGTH,
            default_timeout: Duration::from_secs(30),
            delta_read_size: 2 * 1024 * 1024,
            writer_cadence: Duration::from_secs(1),
            max_compaction_size: 4 * MAX_SERIALIZATION_LENGTH,
            min_utilization: 75,
            iterator_fetch_buckets: 1024,
        }
    }

    /// Embedded-class: small batches, eager compaction
    pub fn embedded() -> Self {
        Self {
            max_batch_size: 4 * MAX_SERIALIZATION_LENGTH,
            default_timeout: Duration::from_secs(10),
            delta_read_size: MAX_SERIALIZATION_LENGTH,
            writer_cadence: Duration::from_millis(250),
            max_compaction_size: 2 * MAX_SERIALIZATION_LENGTH,
            min_utilization: 60,
            iterator_fetch_buckets: 128,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size < MAX_SERIALIZATION_LENGTH {
            return Err("max_batch_size must fit at least one maximum-size record".into());
        }
        if self.default_timeout.is_zero() {
            return Err("default_timeout must be > 0".into());
        }
        if self.delta_read_size < MAX_SERIALIZATION_LENGTH {
            return Err("delta_read_size must fit at least one maximum-size record".into());
        }
        if self.writer_cadence.as_millis() == 0 {
            return Err("writer_cadence must be > 0".into());
        }
        if self.max_compaction_size < MAX_SERIALIZATION_LENGTH {
            return Err("max_compaction_size must fit at least one maximum-size record".into());
        }
        if self.min_utilization > 100 {
            return Err("min_utilization must be in [0, 100]".into());
        }
        if self.iterator_fetch_buckets == 0 {
            return Err("iterator_fetch_buckets must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
