//! Bounded in-memory cache of the most recent entries
//!
//! Serves "recent activity" reads without touching the durable store. The
//! cache evicts independently of persistence state: an entry may be evicted
//! while durable, or visible only here in the window between enqueue and
//! flush.

use std::collections::VecDeque;

use crate::AuditEntry;

/// Fixed-capacity FIFO of recent entries, oldest first
#[derive(Debug)]
pub struct HotCache {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl HotCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when over capacity
    pub fn append(&mut self, entry: AuditEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Replace the contents with entries loaded from durable storage
    ///
    /// `entries` must be oldest-first; only the newest `capacity` are kept.
    pub fn hydrate(&mut self, entries: Vec<AuditEntry>) {
        self.entries.clear();
        let skip = entries.len().saturating_sub(self.capacity);
        self.entries.extend(entries.into_iter().skip(skip));
    }

    /// Clone out the current contents, oldest first
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
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
}
