//! Bounded, newest-first record of completed measurements.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::measure::HistoryEntry;

/// Default number of retained results.
pub const DEFAULT_CAPACITY: usize = 50;

/// Fixed-capacity ring, newest entry first.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl Default for HistoryRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HistoryRing {
    /// A zero capacity is clamped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert at the front, evicting from the back once full.
    pub fn add(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Owned copy, newest first.
    pub fn get_all(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cloneable handle that serializes access to one ring, so scheduled and
/// manual runs finishing together cannot break the capacity invariant.
#[derive(Debug, Clone, Default)]
pub struct History {
    inner: Arc<Mutex<HistoryRing>>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HistoryRing::new(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HistoryRing> {
        // A panic while holding the lock cannot leave the ring over capacity.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, entry: HistoryEntry) {
        self.lock().add(entry);
    }

    pub fn get_all(&self) -> Vec<HistoryEntry> {
        self.lock().get_all()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.lock().latest().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
