// src/server/conn.rs

//! Connection deadline enforcement: a stream wrapper that times out quiet
//! connections, re-arming on activity like the per-state read deadlines of
//! a classic HTTP server.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Budget for a fresh or idle connection to produce its next request.
pub const IDLE_NEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget once the connection has shown activity.
pub const ACTIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Wraps a connection with an activity deadline. A new connection gets the
/// short budget; any successful read or write re-arms the long one. When
/// the deadline passes with the peer still quiet, reads and writes fail
/// with `TimedOut` and hyper tears the connection down.
pub struct DeadlineStream<S> {
    inner: S,
    deadline: Pin<Box<Sleep>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep(IDLE_NEW_TIMEOUT)),
        }
    }

    fn rearm(&mut self) {
        self.deadline
            .as_mut()
            .reset(Instant::now() + ACTIVE_TIMEOUT);
    }

    fn check_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection deadline elapsed",
            ))),
            Poll::Pending => Poll::Ready(Ok(())),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(err)) = this.check_deadline(cx) {
            return Poll::Ready(Err(err));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.rearm();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(err)) = this.check_deadline(cx) {
            return Poll::Ready(Err(err));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.rearm();
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
