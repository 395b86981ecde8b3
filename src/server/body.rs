// src/server/body.rs

//! Response body adapters: cached-item streaming and the boxed body type
//! every handler path converges on.

use crate::lsm::item::{CachedItem, READ_CHUNK_SIZE};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Every handler path converges on this boxed body. Unsync because the
/// pass-through leg wraps the backend byte stream.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Streams the half-open byte range `[pos, end)` of a cached item in 32 KiB
/// chunks. The item's `in_use` count is held for the whole lifetime of the
/// body and released on drop, whether the stream finished or the client
/// disconnected mid-write.
pub struct ItemBody {
    item: Arc<CachedItem>,
    pos: u64,
    end: u64,
}

impl ItemBody {
    /// Takes over one `in_use` reference of `item`.
    pub fn new(item: Arc<CachedItem>, from: u64, to: u64) -> Self {
        Self {
            item,
            pos: from,
            end: to,
        }
    }

    pub fn boxed(self) -> ProxyBody {
        BodyExt::boxed_unsync(self)
    }
}

impl Body for ItemBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.pos >= this.end {
            return Poll::Ready(None);
        }

        let want = ((this.end - this.pos) as usize).min(READ_CHUNK_SIZE);
        let mut buf = vec![0u8; want];
        match this.item.read_chunk(this.pos, &mut buf) {
            Ok(0) => Poll::Ready(Some(Err(std::io::Error::other(
                "cached body shorter than advertised",
            )))),
            Ok(n) => {
                this.pos += n as u64;
                buf.truncate(n);
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(buf)))))
            }
            Err(err) => Poll::Ready(Some(Err(std::io::Error::other(err)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pos >= self.end
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.end - self.pos)
    }
}

impl Drop for ItemBody {
    fn drop(&mut self) {
        self.item.done();
    }
}
