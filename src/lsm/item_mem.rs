// src/lsm/item_mem.rs

//! The in-heap representation of a cached response.

use crate::core::ProxyError;
use crate::lsm::item::ITEM_MEM_SPILL_LIMIT;
use http::{HeaderMap, StatusCode};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::warn;

/// A cached response held on the heap. Bodies that outgrow the spill limit
/// move to an anonymous temp file; the heap buffer is released and subsequent
/// writes append to the file.
#[derive(Debug)]
pub struct MemItem {
    pub key: u64,
    pub status_code: StatusCode,
    pub header: HeaderMap,
    data: Vec<u8>,
    hit: AtomicU64,
    in_use: AtomicI64,
    spill: Option<File>,
    written: u64,
}

impl MemItem {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            key: 0,
            status_code: StatusCode::OK,
            header: HeaderMap::new(),
            data: Vec::with_capacity(cap),
            hit: AtomicU64::new(0),
            in_use: AtomicI64::new(0),
            spill: None,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        if self.spill.is_some() {
            self.written as usize
        } else {
            self.data.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit(&self) -> u64 {
        self.hit.load(Ordering::Relaxed)
    }

    pub fn incr_hit(&self) {
        self.hit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_hit(&self, v: u64) {
        self.hit.store(v, Ordering::Relaxed);
    }

    pub fn in_use(&self) -> i64 {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn incr_in_use(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub fn done(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Appends body bytes, spilling to an anonymous temp file once the
    /// buffered length would cross the limit.
    pub fn write(&mut self, b: &[u8]) -> Result<usize, ProxyError> {
        if let Some(f) = self.spill.as_mut() {
            f.write_all(b)?;
            self.written += b.len() as u64;
            return Ok(b.len());
        }

        if b.len() + self.data.len() > ITEM_MEM_SPILL_LIMIT {
            match tempfile::tempfile() {
                Ok(mut f) => {
                    f.write_all(&self.data)?;
                    f.write_all(b)?;
                    self.written = (self.data.len() + b.len()) as u64;
                    self.data.clear();
                    self.spill = Some(f);
                    return Ok(b.len());
                }
                Err(err) => {
                    // Keep buffering on the heap rather than losing the body.
                    warn!("lsm/item_mem tmp: {err}");
                }
            }
        }

        self.data.extend_from_slice(b);
        Ok(b.len())
    }

    /// Positional body read; safe for concurrent readers.
    pub fn read_chunk(&self, body_off: u64, buf: &mut [u8]) -> Result<usize, ProxyError> {
        let len = self.len() as u64;
        if body_off >= len {
            return Ok(0);
        }
        let n = ((len - body_off) as usize).min(buf.len());
        match self.spill.as_ref() {
            Some(f) => {
                f.read_exact_at(&mut buf[..n], body_off)?;
            }
            None => {
                let off = body_off as usize;
                buf[..n].copy_from_slice(&self.data[off..off + n]);
            }
        }
        Ok(n)
    }

    /// Clears the item for pool reuse. Dropping the spill handle removes the
    /// anonymous file.
    pub fn reset(&mut self) {
        self.key = 0;
        self.status_code = StatusCode::OK;
        self.header.clear();
        self.data.clear();
        self.hit.store(0, Ordering::Relaxed);
        self.in_use.store(0, Ordering::Relaxed);
        self.written = 0;
        self.spill = None;
    }
}
