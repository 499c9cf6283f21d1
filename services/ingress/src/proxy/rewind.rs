//! Replay of already-consumed bytes.
//!
//! Sniffing a connection consumes its first bytes. [`RewindStream`] hands
//! those bytes back out before any further read reaches the underlying
//! stream, so whoever receives the connection sees it exactly as the peer
//! sent it.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A stream that yields a consumed prefix before reading from `inner`.
#[derive(Debug)]
pub struct RewindStream<S> {
    inner: S,
    prefix: Vec<u8>,
    offset: usize,
}

impl<S> RewindStream<S> {
    /// Wrap `inner`, replaying `prefix` first.
    pub fn new(inner: S, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            offset: 0,
        }
    }

    /// Bytes still waiting to be replayed.
    pub fn remaining(&self) -> &[u8] {
        &self.prefix[self.offset..]
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream.
    ///
    /// Reading from it directly skips whatever prefix is left.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Split into the underlying stream and the unreplayed prefix.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let remaining = self.prefix.split_off(self.offset);
        (self.inner, remaining)
    }
}

impl RewindStream<TcpStream> {
    /// Remote address of the underlying connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Local address of the underlying connection.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;

            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_then_inner() {
        let inner = tokio_test::io::Builder::new().read(b" world").build();
        let mut stream = RewindStream::new(inner, b"hello".to_vec());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix_in_order() {
        let inner = tokio_test::io::Builder::new().read(b"!").build();
        let mut stream = RewindStream::new(inner, b"abc".to_vec());

        let mut byte = [0u8; 1];
        let mut out = Vec::new();
        for _ in 0..4 {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1);
            out.push(byte[0]);
        }
        assert_eq!(out, b"abc!");
        assert!(stream.remaining().is_empty());
    }

    #[tokio::test]
    async fn test_inner_error_passes_through_after_prefix() {
        let inner = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut stream = RewindStream::new(inner, b"xy".to_vec());

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_writes_delegate() {
        let inner = tokio_test::io::Builder::new().write(b"pong").build();
        let mut stream = RewindStream::new(inner, b"ping".to_vec());

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_rewind() {
        let inner = tokio_test::io::Builder::new().read(b"3").build();
        let once = RewindStream::new(inner, b"2".to_vec());
        let mut twice = RewindStream::new(once, b"1".to_vec());

        let mut out = Vec::new();
        twice.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"123");
    }

    #[test]
    fn test_into_parts_returns_unreplayed_bytes() {
        let mut stream = RewindStream::new((), b"abcdef".to_vec());
        stream.offset = 2;
        let ((), rest) = stream.into_parts();
        assert_eq!(rest, b"cdef");
    }
}
