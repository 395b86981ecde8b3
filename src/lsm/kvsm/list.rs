// src/lsm/kvsm/list.rs

//! The per-TTL expiration queue, owned exclusively by the sweeper task.

use crate::lsm::kvsm::entry::Entry;
use std::collections::VecDeque;
use std::sync::Arc;

/// Insertion-ordered queue of entries sharing one TTL. Because every entry in
/// a bucket carries the same TTL, expire-at is monotonically non-decreasing
/// from head to tail, so expiration only ever removes from the head.
///
/// Not safe for concurrent mutation: all writes arrive on the sweeper task.
#[derive(Debug, Default)]
pub struct ListTtl {
    entries: VecDeque<Arc<Entry>>,
}

impl ListTtl {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry at the tail.
    pub fn push(&mut self, e: Arc<Entry>) {
        self.entries.push_back(e);
    }

    /// The entry that would expire first, if any.
    pub fn front(&self) -> Option<&Arc<Entry>> {
        self.entries.front()
    }

    /// Unlinks and returns the head entry.
    pub fn pop_front(&mut self) -> Option<Arc<Entry>> {
        self.entries.pop_front()
    }
}
