//! Keyed exclusive locks, one per key hash.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::{TableError, TableResult};
use crate::hasher::KeyHash;
use crate::timer::TimeoutTimer;

type HashMutex = Arc<Mutex<()>>;

/// Lock map keyed by hash. Entries are reference counted and dropped once
/// no holder or waiter remains.
#[derive(Default)]
pub struct HashLocks {
    locks: Mutex<HashMap<KeyHash, HashMutex>>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every hash in `hashes`, which must be sorted and distinct.
    ///
    /// Hashes are taken in ascending order so overlapping batches cannot
    /// deadlock. On timeout every lock taken so far is released.
    pub fn lock_all(&self, hashes: &[KeyHash], timer: &TimeoutTimer) -> TableResult<HashLockGuard<'_>> {
        debug_assert!(hashes.windows(2).all(|w| w[0] < w[1]));
        let mut guard = HashLockGuard { owner: self, held: Vec::with_capacity(hashes.len()) };
        for hash in hashes {
            let mutex = {
                let mut locks = self.locks.lock();
                Arc::clone(locks.entry(*hash).or_insert_with(|| Arc::new(Mutex::new(()))))
            };
            match mutex.try_lock_arc_for(timer.remaining()) {
                Some(held) => guard.held.push((*hash, held)),
                None => {
                    drop(mutex);
                    self.reclaim(*hash);
                    // `guard` drops here and releases the locks already held.
                    return Err(TableError::Timeout { operation: "lock" });
                }
            }
        }
        Ok(guard)
    }

    /// Number of hashes with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reclaim(&self, hash: KeyHash) {
        let mut locks = self.locks.lock();
        if let Some(mutex) = locks.get(&hash) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&hash);
            }
        }
    }
}

/// Holds the locks of one batch. Releases and reclaims them on drop.
pub struct HashLockGuard<'a> {
    owner: &'a HashLocks,
    held: Vec<(KeyHash, ArcMutexGuard<RawMutex, ()>)>,
}

impl Drop for HashLockGuard<'_> {
    fn drop(&mut self) {
        for (hash, held) in self.held.drain(..).rev() {
            drop(held);
            self.owner.reclaim(hash);
        }
    }
}
