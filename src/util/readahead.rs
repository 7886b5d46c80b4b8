//! A manually fillable read buffer for Tokio `AsyncRead` streams.
//!
//! [`ReadAhead`] tracks the current byte offset of a stream: header parsing
//! accumulates and inspects bytes here, consumes exactly the head, and
//! whatever remains (a pipelined request, the first tunnel bytes) is
//! delivered ahead of the inner reader by the `AsyncRead` fallthrough.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub(crate) struct ReadAhead<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> ReadAhead<R> {
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            limit,
        }
    }

    /// The unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// True once the buffer holds `limit` bytes; [`ReadAhead::fill`] will
    /// not grow it further.
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Drops `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader, up to the buffer limit.
    ///
    /// Returns 0 at end of stream or when the buffer is already full.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }

    /// The wrapped reader, for adjusting its deadline state.
    pub(crate) fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadAhead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}
