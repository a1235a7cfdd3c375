//! Stream adapters used once a handshake has completed
//!
//! - [`ObfuscatedStream`] applies a [`CipherPair`] to every byte crossing it
//! - [`PrefixedStream`] replays bytes that were read before the stage existed
//! - [`PendingBuffer`] collects those bytes in arrival order

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::handshake::CipherPair;

/// Read/write stream trait object bound used by the relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream handed to the relay
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Default cap on encrypted bytes held back from the inner writer
pub const DEFAULT_WRITE_LIMIT: usize = 16 * 1024;

/// Raw downstream bytes received before the upstream side was ready
///
/// Chunks are kept in arrival order and replayed exactly once.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; empty chunks are ignored
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total buffered bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Collapse the queue into one contiguous buffer, consuming it
    pub fn into_bytes(mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop_front().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in self.chunks {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            }
        }
    }
}

pin_project! {
    /// A stream that yields `prefix` before reading from `inner`
    ///
    /// Writes go straight to `inner`.
    pub struct PrefixedStream<S> {
        #[pin]
        inner: S,
        prefix: Bytes,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { inner, prefix }
    }

    /// Bytes of the prefix not yet read
    pub fn remaining_prefix(&self) -> usize {
        self.prefix.len()
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

pin_project! {
    /// A stream whose traffic is obfuscated with a cipher pair
    ///
    /// Reads are decrypted in place. Writes are encrypted into a small
    /// holding buffer so that a partial write on `inner` never desynchronises
    /// the keystream: bytes are encrypted exactly once, in order.
    pub struct ObfuscatedStream<S> {
        #[pin]
        inner: S,
        ciphers: CipherPair,
        pending_write: BytesMut,
        write_limit: usize,
    }
}

impl<S> ObfuscatedStream<S> {
    pub fn new(inner: S, ciphers: CipherPair) -> Self {
        Self::with_write_limit(inner, ciphers, DEFAULT_WRITE_LIMIT)
    }

    pub fn with_write_limit(inner: S, ciphers: CipherPair, write_limit: usize) -> Self {
        let write_limit = write_limit.max(1);
        Self {
            inner,
            ciphers,
            pending_write: BytesMut::with_capacity(write_limit),
            write_limit,
        }
    }
}

/// Write out everything held in `pending`
fn poll_drain<S: AsyncWrite>(
    mut inner: Pin<&mut S>,
    pending: &mut BytesMut,
    cx: &mut Context<'_>,
) -> Poll<io::Result<()>> {
    while !pending.is_empty() {
        let n = ready!(inner.as_mut().poll_write(cx, pending))?;
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        pending.advance(n);
    }
    Poll::Ready(Ok(()))
}

impl<S: AsyncRead> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.ciphers.decrypt.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending_write, cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(*this.write_limit);
        this.pending_write.extend_from_slice(&buf[..n]);
        this.ciphers.encrypt.apply(&mut this.pending_write[..]);

        // The bytes are accepted now; anything the socket does not take yet
        // goes out on the next write or flush.
        match this.inner.as_mut().poll_write(cx, this.pending_write) {
            Poll::Ready(Ok(written)) => this.pending_write.advance(written),
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {}
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending_write, cx))?;
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(poll_drain(this.inner.as_mut(), this.pending_write, cx))?;
        this.inner.poll_shutdown(cx)
    }
}
