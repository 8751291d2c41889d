//! Bounded in-memory pipe between a copy's producer and consumer.
//!
//! Built on [`tokio::io::duplex`]: writes block once `capacity` bytes are
//! buffered and unread, and fail with `BrokenPipe` once the reader is gone.
//! The reader only sees a clean end of stream after [`PipeWriter::finish`];
//! if the writer is dropped first, the reader gets `UnexpectedEof` so that a
//! destination never commits a load from a source that failed halfway.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// Create a pipe buffering at most `capacity` bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity.max(1));
    let finished = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            inner: writer,
            finished: Arc::clone(&finished),
        },
        PipeReader {
            inner: reader,
            finished,
        },
    )
}

/// Producer half of [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    inner: DuplexStream,
    finished: Arc<AtomicBool>,
}

impl PipeWriter {
    /// Mark the stream complete and close it.
    pub async fn finish(mut self) -> io::Result<()> {
        self.finished.store(true, Ordering::Release);
        self.inner.shutdown().await
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Consumer half of [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    finished: Arc<AtomicBool>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let at_eof = buf.filled().len() == before && buf.remaining() > 0;
        if at_eof && !self.finished.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source stream ended without completing",
            )));
        }
        Poll::Ready(Ok(()))
    }
}
