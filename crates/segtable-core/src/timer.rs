//! Monotonic per-call deadlines.

use std::time::{Duration, Instant};

use crate::error::{TableError, TableResult};

/// Tracks the time left for one call. Checked before every read, append and
/// lock wait; it is the only place a timeout is observed.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTimer {
    deadline: Instant,
}

impl TimeoutTimer {
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        // Saturate instead of panicking on absurd timeouts.
        let deadline = now.checked_add(timeout).unwrap_or(now + Duration::from_secs(365 * 24 * 3600));
        Self { deadline }
    }

    /// Time left before the deadline (zero once elapsed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Fail with `Timeout` if the deadline has passed.
    pub fn check(&self, operation: &'static str) -> TableResult<()> {
        if self.is_expired() {
            Err(TableError::Timeout { operation })
        } else {
            Ok(())
        }
    }
}
