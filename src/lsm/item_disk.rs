// src/lsm/item_disk.rs

//! The on-disk representation of a cached response: a cited region of a
//! value-log segment.

use crate::core::ProxyError;
use crate::lsm::vfile::VFile;
use arc_swap::ArcSwapOption;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A cached response that lives in a value-log segment. `off` points at the
/// serialized headers; the body follows at `off + head_size`.
#[derive(Debug)]
pub struct DiskItem {
    pub key: u64,
    pub status_code: StatusCode,
    vfile: ArcSwapOption<VFile>,
    pub off: i64,
    pub head_size: i64,
    pub body_size: i64,
    hit: AtomicU64,
    in_use: AtomicI64,
}

impl Default for DiskItem {
    fn default() -> Self {
        Self {
            key: 0,
            status_code: StatusCode::OK,
            vfile: ArcSwapOption::empty(),
            off: 0,
            head_size: 0,
            body_size: 0,
            hit: AtomicU64::new(0),
            in_use: AtomicI64::new(0),
        }
    }
}

impl DiskItem {
    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.body_size == 0
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

    pub fn set_vfile(&self, vf: Arc<VFile>) {
        self.vfile.store(Some(vf));
    }

    /// Drops the segment reference so the file can be removed once every
    /// citing item is gone.
    pub fn clear_vfile(&self) {
        self.vfile.store(None);
    }

    /// Reads the serialized headers back from the segment. `None` means the
    /// region could not be read or parsed; callers treat that as a miss.
    pub fn read_header(&self) -> Option<HeaderMap> {
        let vf = self.vfile.load_full()?;
        let mut buf = vec![0u8; self.head_size as usize];
        vf.read_at(&mut buf, self.off as u64).ok()?;
        parse_header(&buf)
    }

    /// Positional body read; safe for concurrent readers.
    pub fn read_chunk(&self, body_off: u64, buf: &mut [u8]) -> Result<usize, ProxyError> {
        let len = self.body_size as u64;
        if body_off >= len {
            return Ok(0);
        }
        let vf = self.vfile.load_full().ok_or(ProxyError::ReadingItemDisk)?;
        let n = ((len - body_off) as usize).min(buf.len());
        let seek = (self.off + self.head_size) as u64 + body_off;
        vf.read_at(&mut buf[..n], seek)?;
        Ok(n)
    }

    pub fn reset(&mut self) {
        self.key = 0;
        self.status_code = StatusCode::OK;
        self.vfile.store(None);
        self.off = 0;
        self.head_size = 0;
        self.body_size = 0;
        self.hit.store(0, Ordering::Relaxed);
        self.in_use.store(0, Ordering::Relaxed);
    }
}

/// Parses the `name: value\r\n` lines of a serialized header block,
/// terminated by an empty line.
fn parse_header(buf: &[u8]) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in buf.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        let colon = line.iter().position(|&b| b == b':')?;
        let name = HeaderName::from_bytes(&line[..colon]).ok()?;
        let rest = &line[colon + 1..];
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let value = HeaderValue::from_bytes(rest).ok()?;
        headers.append(name, value);
    }
    Some(headers)
}
