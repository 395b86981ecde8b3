// src/lsm/kvsm/mod.rs

//! The TTL-bucketed key/value store backing the memory tier.
//!
//! Reads go straight through a concurrent map. All bucket-list mutation is
//! funneled over a channel to a single sweeper task, so the expiration queues
//! need no lock at all.

pub mod entry;
pub mod list;

use crate::core::metrics;
use crate::lsm::item::CachedItem;
use dashmap::DashMap;
use entry::{Entry, EntryPool};
use list::ListTtl;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the sweeper ingest channel. A full channel applies
/// backpressure to `set`.
const ACTIONS_BUFFER: usize = 1024;

/// Floor for effective TTLs; anything shorter is coerced up.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Sweeper wake-up cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Entries examined between cooperative yields during one sweep.
const SWEEP_YIELD_EVERY: usize = 1000;

/// Callback invoked with every evicted value. Returns the value's remaining
/// reference count so callers can defer teardown of in-use items.
pub type EvictionCallback = Box<dyn Fn(Arc<CachedItem>) -> i64 + Send + Sync>;

struct AddMsg {
    ttl: Duration,
    entry: Arc<Entry>,
}

struct Shared {
    items: DashMap<u64, Arc<Entry>>,
    n: AtomicI64,
    on_evicted: RwLock<Option<EvictionCallback>>,
    pool: EntryPool,
}

impl Shared {
    fn evict(&self, value: Arc<CachedItem>) {
        if let Some(cb) = self.on_evicted.read().as_ref() {
            cb(value);
        }
    }
}

/// The TTL-bucketed store. Cheap to clone handles are not needed; the LSM
/// owns the single instance and shares it behind its own Arc.
pub struct Kvsm {
    shared: Arc<Shared>,
    add_tx: mpsc::Sender<AddMsg>,
}

impl Kvsm {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            items: DashMap::new(),
            n: AtomicI64::new(0),
            on_evicted: RwLock::new(None),
            pool: EntryPool::default(),
        });
        let (add_tx, add_rx) = mpsc::channel(ACTIONS_BUFFER);
        tokio::spawn(sweeper(shared.clone(), add_rx));
        Self { shared, add_tx }
    }

    /// Installs the callback invoked with every evicted value.
    pub fn set_on_evicted(&self, f: EvictionCallback) {
        *self.shared.on_evicted.write() = Some(f);
    }

    pub fn len(&self) -> i64 {
        self.shared.n.load(Ordering::Relaxed)
    }

    /// Overwrite-or-insert. The entry is published to the read map first and
    /// only then handed to the sweeper, so `get` observes it immediately.
    pub async fn set(&self, key: u64, value: Arc<CachedItem>, ttl: Duration) {
        let ttl = ttl.max(MIN_TTL);
        let e = self.shared.pool.get();
        e.publish(key, ttl, value);
        self.shared.items.insert(key, e.clone());
        self.shared.n.fetch_add(1, Ordering::Relaxed);
        // Blocks when the sweeper is behind: backpressure on the admitter.
        let _ = self.add_tx.send(AddMsg { ttl, entry: e }).await;
    }

    /// Lock-free read. `expired` reports whether the deadline has passed; the
    /// value is still returned so the caller can decide stale-serve policy.
    pub fn get(&self, key: u64) -> Option<(Arc<CachedItem>, bool)> {
        let e = self.shared.items.get(&key).map(|r| Arc::clone(r.value()))?;
        let value = e.get_value()?;
        Some((value, e.expired()))
    }

    /// Atomic value swap when the key exists, otherwise a plain `set`. The
    /// previous value goes through the eviction callback.
    pub async fn swap(&self, key: u64, value: Arc<CachedItem>, ttl: Duration) {
        let existing = self.shared.items.get(&key).map(|r| Arc::clone(r.value()));
        match existing {
            Some(e) => {
                if let Some(old) = e.swap_value(Some(value)) {
                    self.shared.evict(old);
                }
            }
            None => self.set(key, value, ttl).await,
        }
    }

    /// Deletes the key from the read map and clears the entry in place. The
    /// husk stays queued in its bucket and is recycled on the next sweep.
    pub fn remove_by_key(&self, key: u64) {
        if let Some((_, e)) = self.shared.items.remove(&key) {
            self.shared.n.fetch_sub(1, Ordering::Relaxed);
            if let Some(old) = e.swap_value(None) {
                self.shared.evict(old);
            }
            e.clear();
        }
    }
}

/// The single task that owns the TTL buckets. Ingests entries published by
/// `set` and walks the buckets once per second evicting expired values.
async fn sweeper(shared: Arc<Shared>, mut add_rx: mpsc::Receiver<AddMsg>) {
    let mut buckets: BTreeMap<Duration, ListTtl> = BTreeMap::new();
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = add_rx.recv() => {
                match msg {
                    Some(AddMsg { ttl, entry }) => {
                        buckets.entry(ttl).or_default().push(entry);
                    }
                    // All senders gone: the store was dropped.
                    None => {
                        debug!("kvsm sweeper shutting down");
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                sweep(&shared, &mut buckets).await;
            }
        }
    }
}

async fn sweep(shared: &Arc<Shared>, buckets: &mut BTreeMap<Duration, ListTtl>) {
    let mut examined = 0usize;
    for (_ttl, bucket) in buckets.iter_mut() {
        if bucket.is_empty() {
            continue;
        }
        loop {
            examined += 1;
            if examined.is_multiple_of(SWEEP_YIELD_EVERY) {
                tokio::task::yield_now().await;
            }

            let expired = match bucket.front() {
                None => break,
                Some(e) => e.get_value().is_none() || e.expired(),
            };
            if !expired {
                // Entries behind the head expire no earlier; done with this bucket.
                break;
            }

            let Some(e) = bucket.pop_front() else { break };
            collect(shared, e);
        }
    }
}

/// Retires one entry the sweep pulled off a bucket.
fn collect(shared: &Arc<Shared>, e: Arc<Entry>) {
    if let Some(value) = e.swap_value(None) {
        // The map slot may already belong to a newer entry for the same key;
        // only delete it when it is still this exact entry.
        shared
            .items
            .remove_if(&e.key(), |_, current| Arc::ptr_eq(current, &e));
        shared.n.fetch_sub(1, Ordering::Relaxed);
        metrics::CACHE_EVICTIONS_TOTAL.inc();
        shared.evict(value);
    }
    shared.pool.put(e);
}

impl Default for Kvsm {
    fn default() -> Self {
        Self::new()
    }
}
