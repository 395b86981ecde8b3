// src/lsm/item.rs

//! The two representations of a cached response and their pools.

use crate::core::ProxyError;
use crate::lsm::item_disk::DiskItem;
use crate::lsm::item_mem::MemItem;
use http::{HeaderMap, StatusCode};
use lazy_static::lazy_static;
use parking_lot::Mutex;

/// Smallest pooled buffer size.
pub const ITEM_MEM_MIN_SIZE: usize = 1024;
/// Largest pooled buffer size; bigger buffers are never pooled.
pub const ITEM_MEM_MAX_SIZE: usize = 5 * 1024 * 1024;
/// Buffered length past which a memory item spills to a temp file.
pub const ITEM_MEM_SPILL_LIMIT: usize = 4 * 1024 * 1024;
/// Chunk size for positional reads.
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

const ITEM_DISK_POOL_CAP: usize = 4096;
const ITEM_MEM_POOL_BUCKET_CAP: usize = 64;

lazy_static! {
    static ref ITEM_MEM_POOL: Vec<Mutex<Vec<MemItem>>> = (0..ITEM_MEM_MAX_SIZE
        / ITEM_MEM_MIN_SIZE)
        .map(|_| Mutex::new(Vec::new()))
        .collect();
    static ref ITEM_DISK_POOL: Mutex<Vec<DiskItem>> = Mutex::new(Vec::new());
}

fn calc_index(l: usize) -> usize {
    (l / ITEM_MEM_MIN_SIZE) % ITEM_MEM_POOL.len()
}

/// Fetches a memory item from the pool, sized for `len_hint` bytes.
pub fn get_item(len_hint: usize) -> MemItem {
    let l = len_hint.min(ITEM_MEM_MAX_SIZE);
    match ITEM_MEM_POOL[calc_index(l)].lock().pop() {
        Some(itm) => itm,
        None => MemItem::with_capacity(l),
    }
}

/// Returns a memory item to its size bucket. Oversized buffers are dropped.
pub fn put_item(mut itm: MemItem) {
    let l = itm.capacity();
    itm.reset();
    if l > ITEM_MEM_MAX_SIZE {
        return;
    }
    let bucket = if l <= ITEM_MEM_MIN_SIZE {
        &ITEM_MEM_POOL[0]
    } else {
        &ITEM_MEM_POOL[calc_index(l)]
    };
    let mut bucket = bucket.lock();
    if bucket.len() < ITEM_MEM_POOL_BUCKET_CAP {
        bucket.push(itm);
    }
}

pub fn get_item_disk() -> DiskItem {
    ITEM_DISK_POOL.lock().pop().unwrap_or_default()
}

pub fn put_item_disk(mut itd: DiskItem) {
    itd.reset();
    let mut pool = ITEM_DISK_POOL.lock();
    if pool.len() < ITEM_DISK_POOL_CAP {
        pool.push(itd);
    }
}

/// A cached response. At any moment a key is represented by at most one live
/// variant; the memory-to-disk transition swaps the whole value atomically.
#[derive(Debug)]
pub enum CachedItem {
    Mem(MemItem),
    Disk(DiskItem),
}

impl CachedItem {
    pub fn key(&self) -> u64 {
        match self {
            CachedItem::Mem(i) => i.key,
            CachedItem::Disk(i) => i.key,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CachedItem::Mem(i) => i.status_code,
            CachedItem::Disk(i) => i.status_code,
        }
    }

    /// The response headers, re-read from disk for the disk variant. `None`
    /// means the serialization could not be read back and the caller should
    /// treat the lookup as a miss.
    pub fn header(&self) -> Option<HeaderMap> {
        match self {
            CachedItem::Mem(i) => Some(i.header.clone()),
            CachedItem::Disk(i) => i.read_header(),
        }
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        match self {
            CachedItem::Mem(i) => i.len(),
            CachedItem::Disk(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit(&self) -> u64 {
        match self {
            CachedItem::Mem(i) => i.hit(),
            CachedItem::Disk(i) => i.hit(),
        }
    }

    pub fn incr_hit(&self) {
        match self {
            CachedItem::Mem(i) => i.incr_hit(),
            CachedItem::Disk(i) => i.incr_hit(),
        }
    }

    pub fn in_use(&self) -> i64 {
        match self {
            CachedItem::Mem(i) => i.in_use(),
            CachedItem::Disk(i) => i.in_use(),
        }
    }

    pub fn incr_in_use(&self) {
        match self {
            CachedItem::Mem(i) => i.incr_in_use(),
            CachedItem::Disk(i) => i.incr_in_use(),
        }
    }

    /// Marks the item as no longer used by one reader, unblocking eviction.
    pub fn done(&self) {
        match self {
            CachedItem::Mem(i) => i.done(),
            CachedItem::Disk(i) => i.done(),
        }
    }

    /// Reads body bytes starting at `body_off` into `buf`, returning how many
    /// were read. Zero means end of body.
    pub fn read_chunk(&self, body_off: u64, buf: &mut [u8]) -> Result<usize, ProxyError> {
        match self {
            CachedItem::Mem(i) => i.read_chunk(body_off, buf),
            CachedItem::Disk(i) => i.read_chunk(body_off, buf),
        }
    }

    /// Copies the full body into `w`.
    pub fn write_to(&self, w: &mut dyn std::io::Write) -> Result<u64, ProxyError> {
        self.write_range_to(w, 0, self.len() as i64)
    }

    /// Copies the half-open byte range `[from, to)` of the body into `w`.
    pub fn write_range_to(
        &self,
        w: &mut dyn std::io::Write,
        from: i64,
        to: i64,
    ) -> Result<u64, ProxyError> {
        if from < 0 || to < 0 || from > to || from > self.len() as i64 {
            return Err(ProxyError::WrongRange);
        }
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut off = from as u64;
        let end = to as u64;
        let mut written = 0u64;
        while off < end {
            let want = ((end - off) as usize).min(buf.len());
            let n = self.read_chunk(off, &mut buf[..want])?;
            if n == 0 {
                return Err(ProxyError::ReadingItemDisk);
            }
            w.write_all(&buf[..n]).map_err(ProxyError::from)?;
            off += n as u64;
            written += n as u64;
        }
        Ok(written)
    }

    /// The full body as one allocation. Not for the serving path.
    pub fn bytes(&self) -> Result<Vec<u8>, ProxyError> {
        let mut out = Vec::with_capacity(self.len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Normalizes an inclusive HTTP byte range request against the body
    /// length, returning the half-open `(from, to)` plus its length.
    pub fn valid_range(&self, req_start: i64, req_end: i64) -> Result<(i64, i64, i64), ProxyError> {
        if req_start < 0 {
            return Err(ProxyError::WrongRange);
        }

        let itm_len = self.len() as i64;
        let mut req_end = req_end;
        if req_end >= itm_len {
            req_end = itm_len;
        } else {
            req_end += 1;
        }

        if req_start == 0 && req_end == 0 {
            return Ok((0, itm_len, itm_len));
        }

        let req_length = req_end - req_start;
        if req_length == 0 {
            return Err(ProxyError::WrongRange);
        }

        Ok((req_start, req_end, req_length))
    }
}
