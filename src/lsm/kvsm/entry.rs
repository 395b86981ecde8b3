// src/lsm/kvsm/entry.rs

//! The shared map entry and its free-list pool.

use crate::lsm::item::CachedItem;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on recycled entries kept around between sweeps.
const ENTRY_POOL_CAP: usize = 1024;

/// Returns the current wall clock as unix nanoseconds.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// One slot in the store. The value is swapped atomically so a reader racing
/// with a memory-to-disk migration always observes a fully published item.
#[derive(Debug, Default)]
pub struct Entry {
    key: AtomicU64,
    expire_at: AtomicI64,
    value: ArcSwapOption<CachedItem>,
}

impl Entry {
    pub fn key(&self) -> u64 {
        self.key.load(Ordering::Acquire)
    }

    pub fn expire_at(&self) -> i64 {
        self.expire_at.load(Ordering::Acquire)
    }

    /// Returns true once the wall clock has passed the entry's deadline.
    pub fn expired(&self) -> bool {
        now_nanos() > self.expire_at.load(Ordering::Acquire)
    }

    pub fn get_value(&self) -> Option<Arc<CachedItem>> {
        self.value.load_full()
    }

    /// Atomically replaces the value, returning the previous one.
    pub fn swap_value(&self, value: Option<Arc<CachedItem>>) -> Option<Arc<CachedItem>> {
        self.value.swap(value)
    }

    /// Clears the value and deadline. The entry stays in its bucket and is
    /// recycled when the sweep reaches it.
    pub fn clear(&self) {
        self.value.store(None);
        self.expire_at.store(0, Ordering::Release);
    }

    pub(crate) fn publish(&self, key: u64, ttl: Duration, value: Arc<CachedItem>) {
        self.key.store(key, Ordering::Release);
        self.expire_at
            .store(now_nanos() + ttl.as_nanos() as i64, Ordering::Release);
        self.value.store(Some(value));
    }

    fn reset(&self) {
        self.key.store(0, Ordering::Release);
        self.expire_at.store(0, Ordering::Release);
        self.value.store(None);
    }
}

/// Free-list of entries. A pooled entry is reused only once it is uniquely
/// owned; anything still referenced elsewhere is dropped instead.
#[derive(Debug, Default)]
pub struct EntryPool {
    free: Mutex<Vec<Arc<Entry>>>,
}

impl EntryPool {
    pub fn get(&self) -> Arc<Entry> {
        let mut free = self.free.lock();
        while let Some(e) = free.pop() {
            if Arc::strong_count(&e) == 1 {
                return e;
            }
        }
        Arc::new(Entry::default())
    }

    pub fn put(&self, e: Arc<Entry>) {
        e.reset();
        let mut free = self.free.lock();
        if free.len() < ENTRY_POOL_CAP {
            free.push(e);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }
}
