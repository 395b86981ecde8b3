// src/lsm/vlog.rs

//! The TTL-sharded value-log writer: routes memory items into the disk
//! segment dedicated to their TTL class.

use crate::core::{ProxyError, metrics};
use crate::lsm::item::{CachedItem, get_item_disk};
use crate::lsm::item_disk::DiskItem;
use crate::lsm::vfile::VFile;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Record terminator, written after every serialized response.
pub const END_RECORD_MARK: &[u8] = b">>>>>!ELINPROXY\n";
const NEW_LINE: &[u8] = b"\r\n";

/// Segment rotation threshold.
const DEFAULT_MAX_FILE_SIZE: i64 = 1000 * 1024 * 1024;
/// Capacity of each per-TTL writer queue.
const DEFAULT_TRANSFORM_BUFFER: usize = 100_000;
/// Serialization attempts before an item is dropped from the migration.
const WRITE_TRIES: usize = 3;

/// Completion notice for one migrated item; the orchestrator swaps the
/// memory representation for this disk one.
pub struct AfterWrite {
    pub item: Arc<CachedItem>,
    pub ttl: Duration,
}

/// Fan-out by TTL: one writer task per distinct integer-seconds TTL value,
/// created lazily on the first item of that class.
pub struct Vlog {
    dir: PathBuf,
    writers: DashMap<u64, mpsc::Sender<Arc<CachedItem>>>,
    after_tx: mpsc::Sender<AfterWrite>,
}

impl Vlog {
    pub fn new(dir: PathBuf, after_tx: mpsc::Sender<AfterWrite>) -> Arc<Self> {
        Arc::new(Self {
            dir,
            writers: DashMap::new(),
            after_tx,
        })
    }

    /// Enqueues a memory item onto its TTL class queue, instantiating the
    /// writer task on first use. The entry API makes the creation one-shot
    /// even under concurrent first writers.
    pub async fn set(&self, itm: Arc<CachedItem>, ttl: Duration) {
        let secs = ttl.as_secs();
        let tx = match self.writers.get(&secs) {
            Some(tx) => tx.clone(),
            None => match self.writers.entry(secs) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = mpsc::channel(DEFAULT_TRANSFORM_BUFFER);
                    tokio::spawn(writer(ttl, rx, self.dir.clone(), self.after_tx.clone()));
                    vacant.insert(tx.clone());
                    tx
                }
            },
        };
        let _ = tx.send(itm).await;
    }
}

fn must_open(ttl: Duration, dir: &Path) -> Arc<VFile> {
    // The cache cannot function without a usable disk tier.
    VFile::new(ttl, dir)
        .unwrap_or_else(|err| panic!("lsm/vfile create in {}: {err}", dir.display()))
}

/// One TTL class worth of migrations: serializes items into the current
/// segment, rotating it on expiry, write failure or size overflow.
async fn writer(
    ttl: Duration,
    mut rx: mpsc::Receiver<Arc<CachedItem>>,
    dir: PathBuf,
    after_tx: mpsc::Sender<AfterWrite>,
) {
    let mut vf = must_open(ttl, &dir);

    while let Some(itm) = rx.recv().await {
        if vf.expired() {
            rotate(&mut vf, ttl, &dir);
        }

        for attempt in 1..=WRITE_TRIES {
            match transform(&vf, &itm) {
                Ok(itd) => {
                    metrics::CACHE_DISK_MIGRATIONS_TOTAL.inc();
                    let _ = after_tx
                        .send(AfterWrite {
                            item: Arc::new(CachedItem::Disk(itd)),
                            ttl,
                        })
                        .await;
                    break;
                }
                Err(err) => {
                    // The memory item stays authoritative if all tries fail.
                    warn!("lsm/vlog write attempt {attempt}: {err}");
                    rotate(&mut vf, ttl, &dir);
                }
            }
        }

        if vf.seek() > DEFAULT_MAX_FILE_SIZE {
            rotate(&mut vf, ttl, &dir);
        }
    }
}

/// Swaps in a fresh segment and retires the old one.
fn rotate(vf: &mut Arc<VFile>, ttl: Duration, dir: &Path) {
    let old = std::mem::replace(vf, must_open(ttl, dir));
    old.auto_expire();
}

/// Serializes one memory item into the segment: headers, blank line, body,
/// end-of-record sentinel. Returns the disk item citing the written region.
fn transform(vf: &Arc<VFile>, itm: &CachedItem) -> Result<DiskItem, ProxyError> {
    let mem = match itm {
        CachedItem::Mem(m) => m,
        CachedItem::Disk(_) => return Err(ProxyError::ItemDiskWrite),
    };

    let off = vf.seek();

    let mut head = Vec::with_capacity(256);
    for name in mem.header.keys() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        let mut first = true;
        for value in mem.header.get_all(name) {
            if !first {
                head.extend_from_slice(b", ");
            }
            head.extend_from_slice(value.as_bytes());
            first = false;
        }
        head.extend_from_slice(NEW_LINE);
    }
    vf.write_all(&head)?;
    vf.write_all(NEW_LINE)?;
    let head_size = vf.seek() - off;

    let nb = itm.write_to(&mut VFileWriter(vf))?;
    let body_size = vf.seek() - off - head_size;
    if body_size != nb as i64 {
        warn!("lsm/vlog body size: {body_size}/{nb}");
    }
    vf.write_all(END_RECORD_MARK)?;

    let mut itd = get_item_disk();
    itd.key = mem.key;
    itd.status_code = mem.status_code;
    itd.off = off;
    itd.head_size = head_size;
    itd.body_size = body_size;
    itd.set_vfile(Arc::clone(vf));
    itd.set_hit(mem.hit());
    Ok(itd)
}

struct VFileWriter<'a>(&'a VFile);

impl std::io::Write for VFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_all(buf).map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
