// src/lsm/vfile.rs

//! One append-only disk segment tied to a TTL class.

use crate::core::ProxyError;
use crate::lsm::kvsm::entry::now_nanos;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

static FILE_NO: AtomicI64 = AtomicI64::new(0);

/// Slack added to the nominal deadline so records written just before
/// rotation stay readable until their TTL actually elapses.
const EXPIRE_SLACK: Duration = Duration::from_secs(5);

/// Longest wait between writer retirement and releasing the rotation guard.
const MAX_CLOSE_WAIT: Duration = Duration::from_secs(3600);

/// An append-only segment file. The writer belongs to a single VLog task;
/// reads are positional and safe from any number of concurrent readers.
/// The file is unlinked when the last reference (the rotation guard or a
/// citing disk item) goes away.
#[derive(Debug)]
pub struct VFile {
    ttl: Duration,
    expire_at: AtomicI64,
    name: PathBuf,
    writer: Mutex<Option<File>>,
    reader: RwLock<Option<File>>,
    size: AtomicI64,
    auto_expire: AtomicU64,
}

impl VFile {
    pub fn new(ttl: Duration, dir: &Path) -> Result<Arc<Self>, ProxyError> {
        let ttl_str = humantime::format_duration(ttl).to_string().replace(' ', "");
        let name = dir.join(format!(
            "mem-{}-{:09}.bin",
            ttl_str,
            FILE_NO.fetch_add(1, Ordering::Relaxed) + 1
        ));

        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&name)?;
        let reader = File::open(&name)?;

        Ok(Arc::new(Self {
            ttl,
            expire_at: AtomicI64::new(now_nanos() + (ttl + EXPIRE_SLACK).as_nanos() as i64),
            name,
            writer: Mutex::new(Some(writer)),
            reader: RwLock::new(Some(reader)),
            size: AtomicI64::new(0),
            auto_expire: AtomicU64::new(0),
        }))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn expired(&self) -> bool {
        now_nanos() > self.expire_at.load(Ordering::Acquire)
    }

    /// Appends to the segment, refreshing the deadline.
    pub fn write_all(&self, b: &[u8]) -> Result<(), ProxyError> {
        self.expire_at.store(
            now_nanos() + (self.ttl + EXPIRE_SLACK).as_nanos() as i64,
            Ordering::Release,
        );
        let mut writer = self.writer.lock();
        let f = writer
            .as_mut()
            .ok_or_else(|| ProxyError::Internal("segment writer closed".into()))?;
        f.write_all(b)?;
        self.size.fetch_add(b.len() as i64, Ordering::AcqRel);
        Ok(())
    }

    /// Positional read; fails once the reader has been retired.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<(), ProxyError> {
        let reader = self.reader.read();
        let f = reader.as_ref().ok_or(ProxyError::ReadingItemDisk)?;
        f.read_exact_at(buf, off)?;
        Ok(())
    }

    /// The last byte position in the file.
    pub fn seek(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn close_writer(&self) {
        if self.writer.lock().take().is_some() {
            debug!("lsm/vfile close writer {}", self.name.display());
        }
    }

    fn close_reader(&self) {
        self.reader.write().take();
    }

    /// Retires the segment: closes the writer immediately and parks the
    /// rotation guard on a timer so that records written just before
    /// rotation can still be read until their TTL elapses. Idempotent.
    pub fn auto_expire(self: Arc<Self>) {
        if self.auto_expire.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }
        self.close_writer();

        tokio::spawn(async move {
            let max = (self.ttl / 4).min(MAX_CLOSE_WAIT);
            tokio::time::sleep(self.ttl + max).await;
            debug!("lsm/vfile rotation guard released {}", self.name.display());
            // Dropping the guard lets the citing disk items decide when the
            // file actually goes away.
        });
    }
}

impl Drop for VFile {
    fn drop(&mut self) {
        if self.writer.get_mut().is_some() {
            // Removal should always be driven by eviction after auto_expire.
            warn!(
                "lsm/vfile dropped with writer still open {}",
                self.name.display()
            );
        }
        self.close_reader();
        if let Err(err) = std::fs::remove_file(&self.name)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("lsm/vfile remove {}: {err}", self.name.display());
        }
        debug!("lsm/vfile removed {}", self.name.display());
    }
}
