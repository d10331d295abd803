//! ==============================================================================
//! history.rs - bounded, newest-first store of accepted readings
//! ==============================================================================
//!
//! purpose:
//!     keeps the last `capacity` readings in memory for the poll api and for
//!     replay to new push subscribers. it is also where sequence ids come from.
//!
//! concurrency:
//!     single writer (the ingestion pipeline), many readers (http handlers,
//!     dispatcher replay). an rwlock guards the deque; readers clone `Arc`s
//!     out of it so a reading is never observed half-written and is
//!     immutable once inserted.
//!
//!     the id is assigned under the write lock, so ids are strictly
//!     increasing and gap-free for the whole process lifetime.
//!
//! ==============================================================================

use crate::domain::Reading;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// front = newest
    entries: VecDeque<Arc<Reading>>,
    last_id: u64,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                last_id: 0,
            }),
        }
    }

    /// assign the next sequence id, store the reading and evict the oldest
    /// entry if the buffer is over capacity
    pub fn insert(&self, mut reading: Reading) -> Arc<Reading> {
        debug_assert!(!reading.kind.is_control(), "control records are never sequenced");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        inner.last_id += 1;
        reading.sequence_id = inner.last_id;
        let reading = Arc::new(reading);

        inner.entries.push_front(reading.clone());
        if inner.entries.len() > self.capacity {
            inner.entries.pop_back();
        }
        reading
    }

    /// up to `limit` readings, newest first
    pub fn snapshot(&self, limit: usize) -> Vec<Arc<Reading>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.iter().take(limit).cloned().collect()
    }

    /// highest sequence id currently held, 0 when empty
    pub fn latest_id(&self) -> u64 {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.front().map(|r| r.sequence_id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
