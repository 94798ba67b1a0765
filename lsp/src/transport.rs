//! The worker's stdio as one duplex byte stream.
//!
//! No framing happens here: bytes written go to the worker's stdin unchanged
//! and bytes the worker prints come back unchanged. stderr never enters this
//! stream; the supervisor forwards it to the output channel instead.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout};

use crate::log_sink::{LogSink, trim_line_ending};

/// Read end that can mirror what it reads into the output channel.
///
/// The mirror is a debugging aid; it only observes bytes on their way to the
/// reader and never alters them.
#[derive(Debug)]
pub struct StdoutTap<R> {
    inner: R,
    mirror: Option<LogSink>,
}

impl<R> StdoutTap<R> {
    pub fn new(inner: R, mirror: Option<LogSink>) -> Self {
        Self { inner, mirror }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for StdoutTap<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(mirror)) = (&poll, &this.mirror)
            && let Some(fresh) = buf.filled().get(before..)
            && !fresh.is_empty()
        {
            mirror.append_line(trim_line_ending(&String::from_utf8_lossy(fresh)));
        }
        poll
    }
}

/// Duplex stream handed to the protocol session: worker stdout as the read
/// end, worker stdin as the write end.
///
/// The session owns the streams once it has the handle. Dropping the write end
/// closes the worker's stdin, which most workers take as a request to exit.
#[derive(Debug)]
pub struct TransportHandle {
    reader: StdoutTap<ChildStdout>,
    writer: ChildStdin,
}

impl TransportHandle {
    pub(crate) fn new(reader: StdoutTap<ChildStdout>, writer: ChildStdin) -> Self {
        Self { reader, writer }
    }

    /// Split into independently owned read and write ends.
    pub fn into_split(self) -> (StdoutTap<ChildStdout>, ChildStdin) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for TransportHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for TransportHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
