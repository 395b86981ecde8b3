// src/lsm/mod.rs

//! The tiered cache engine: a TTL-bucketed memory tier plus an append-only
//! disk tier, orchestrated so that a key is always represented by exactly
//! one live item.

pub mod item;
pub mod item_disk;
pub mod item_mem;
pub mod kvsm;
pub mod vfile;
pub mod vlog;

use crate::core::{ProxyError, metrics};
use item::{CachedItem, get_item, put_item, put_item_disk};
use item_mem::MemItem;
use kvsm::Kvsm;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;
use vlog::{AfterWrite, Vlog};

const RETRY_EVICTION_SIZE: usize = 1024;
const AFTER_WRITE_BUFFER: usize = 1024;

/// Engine configuration, a sub-table of the handler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LsmConfig {
    /// Items with a TTL above this threshold also migrate to disk.
    #[serde(with = "humantime_serde")]
    pub min_lsm_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub extra_ttl: Duration,
    /// Disk tier directory; cleared on startup.
    pub dir: PathBuf,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            min_lsm_ttl: Duration::from_secs(5 * 60),
            extra_ttl: Duration::from_secs(10),
            dir: std::env::temp_dir().join("elinproxy"),
        }
    }
}

/// The two-tier cache orchestrator.
pub struct Lsm {
    cfg: RwLock<LsmConfig>,
    vlog: Arc<Vlog>,
    mem: Arc<Kvsm>,
}

impl Lsm {
    /// Builds the engine. The disk directory is cleared: the disk tier does
    /// not survive restarts.
    pub fn new(cfg: LsmConfig) -> Result<Arc<Self>, ProxyError> {
        remove_contents(&cfg.dir)?;

        let (retry_tx, retry_rx) = mpsc::channel(RETRY_EVICTION_SIZE);
        let (after_tx, after_rx) = mpsc::channel(AFTER_WRITE_BUFFER);

        let mem = Arc::new(Kvsm::new());
        let vlog = Vlog::new(cfg.dir.clone(), after_tx);

        {
            let retry_tx = retry_tx.clone();
            mem.set_on_evicted(Box::new(move |item| on_evict_internal(&retry_tx, item)));
        }

        tokio::spawn(after_write_loop(Arc::clone(&mem), after_rx));
        tokio::spawn(retry_eviction(retry_rx, retry_tx));

        Ok(Arc::new(Self {
            cfg: RwLock::new(cfg),
            vlog,
            mem,
        }))
    }

    pub fn reload(&self, cfg: LsmConfig) {
        *self.cfg.write() = cfg;
    }

    /// A pooled memory item sized for `len_hint` body bytes.
    pub fn new_item(&self, len_hint: usize) -> MemItem {
        get_item(len_hint)
    }

    /// Admits a response to the memory tier, and to the disk migration queue
    /// when the TTL is long enough to be worth a segment write. Returns the
    /// published item so the admitter can serve from it directly.
    pub async fn set(&self, key: u64, mut itm: MemItem, ttl: Duration) -> Arc<CachedItem> {
        itm.key = key;
        let min_lsm_ttl = self.cfg.read().min_lsm_ttl;
        let item = Arc::new(CachedItem::Mem(itm));
        self.mem.set(key, Arc::clone(&item), ttl).await;
        if ttl > min_lsm_ttl {
            self.vlog.set(Arc::clone(&item), ttl).await;
        }
        item
    }

    /// Looks up a key. A returned item has `in_use` already incremented; the
    /// caller must call `done()` when finished with it. The second value
    /// reports staleness; stale-serve policy belongs to the caller.
    pub fn get(&self, key: u64) -> Result<(Arc<CachedItem>, bool), ProxyError> {
        match self.mem.get(key) {
            Some((item, expired)) => {
                item.incr_in_use();
                item.incr_hit();
                metrics::CACHE_HITS_TOTAL.inc();
                Ok((item, expired))
            }
            None => {
                metrics::CACHE_MISSES_TOTAL.inc();
                Err(ProxyError::ItemNotFound)
            }
        }
    }

    /// Evicts a key immediately.
    pub fn delete(&self, key: u64) {
        self.mem.remove_by_key(key);
    }

    /// Number of live entries in the memory tier.
    pub fn len(&self) -> i64 {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposes one evicted value, or defers when a reader still holds it.
/// Returns the observed reference count so the retry loop can back off.
fn on_evict_internal(retry_tx: &mpsc::Sender<Arc<CachedItem>>, item: Arc<CachedItem>) -> i64 {
    let n = item.in_use();
    if n == 0 {
        match Arc::try_unwrap(item) {
            Ok(CachedItem::Mem(itm)) => put_item(itm),
            Ok(CachedItem::Disk(itd)) => {
                itd.clear_vfile();
                put_item_disk(itd);
            }
            // A racing reader still holds a reference; its drop frees it.
            Err(_shared) => {}
        }
        return 0;
    }

    if retry_tx.try_send(item).is_err() {
        warn!("lsm retry eviction channel full");
    }
    n
}

/// Re-attempts disposal of items that were still referenced when evicted,
/// sleeping proportionally to the observed contention.
async fn retry_eviction(
    mut rx: mpsc::Receiver<Arc<CachedItem>>,
    retry_tx: mpsc::Sender<Arc<CachedItem>>,
) {
    while let Some(item) = rx.recv().await {
        let n = on_evict_internal(&retry_tx, item);
        if n > 0 {
            tokio::time::sleep(Duration::from_secs(n as u64)).await;
        }
    }
}

/// Swaps each freshly written disk item in for its memory twin. The swapped
/// out memory item goes through the eviction callback.
async fn after_write_loop(mem: Arc<Kvsm>, mut rx: mpsc::Receiver<AfterWrite>) {
    while let Some(AfterWrite { item, ttl }) = rx.recv().await {
        mem.swap(item.key(), item, ttl).await;
    }
}

/// Empties the disk tier directory, creating it if needed.
fn remove_contents(dir: &std::path::Path) -> Result<(), ProxyError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
