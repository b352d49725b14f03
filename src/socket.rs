//! Stream wrappers for the two proxy legs.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;

/// A stream that fails once no read or write moves bytes for `limit`.
///
/// The deadline resets on every completed read or write, so a transfer
/// that is slow but still making progress is never cut off; only a leg
/// where nothing moves for the whole window times out.
#[derive(Debug)]
pub(crate) struct Watched<S> {
  inner: S,
  limit: Duration,
  deadline: Pin<Box<Sleep>>,
}

impl<S> Watched<S> {
  pub fn new(inner: S, limit: Duration) -> Self {
    Self {
      inner,
      limit,
      deadline: Box::pin(tokio::time::sleep(limit)),
    }
  }
}

fn stalled() -> std::io::Error {
  std::io::Error::new(
    std::io::ErrorKind::TimedOut,
    "no bytes moved within the idle window",
  )
}

impl<S: AsyncRead + Unpin> AsyncRead for Watched<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        let next = tokio::time::Instant::now() + this.limit;
        this.deadline.as_mut().reset(next);
        Poll::Ready(result)
      }
      Poll::Pending => {
        if this.deadline.as_mut().poll(cx).is_ready() {
          return Poll::Ready(Err(stalled()));
        }
        Poll::Pending
      }
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Watched<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        let next = tokio::time::Instant::now() + this.limit;
        this.deadline.as_mut().reset(next);
        Poll::Ready(result)
      }
      Poll::Pending => {
        if this.deadline.as_mut().poll(cx).is_ready() {
          return Poll::Ready(Err(stalled()));
        }
        Poll::Pending
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// Origin-leg stream: plain TCP for `http`, TLS for `https`. Both carry
/// the per-read idle watchdog.
#[derive(Debug)]
pub(crate) enum MaybeTlsStream {
  /// TCP
  Tcp(Watched<TcpStream>),
  /// TLS
  Tls(Box<TlsStream<Watched<TcpStream>>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// A stream with a byte prefix replayed ahead of the inner reads.
///
/// After the `200 Connection Established` reply to a CONNECT, bytes the
/// client pipelined behind the request (typically the start of its TLS
/// ClientHello) may already sit in our read buffer. Handing the raw socket
/// to the TLS acceptor would lose them, so the leftover buffer is replayed
/// first.
#[derive(Debug)]
pub(crate) struct Rewind<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> Rewind<S> {
  pub fn new(prefix: Bytes, inner: S) -> Self {
    Self { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if !this.prefix.is_empty() {
      let n = std::cmp::min(this.prefix.len(), buf.remaining());
      buf.put_slice(&this.prefix.split_to(n));
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn watched_read_survives_slow_but_active_peer() {
    let (mut tx, rx) = tokio::io::duplex(64);
    let mut watched = Watched::new(rx, Duration::from_millis(120));
    let writer = tokio::spawn(async move {
      for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.write_all(b"x").await.unwrap();
      }
    });
    let mut out = Vec::new();
    watched.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"xxxxx");
    writer.await.unwrap();
  }

  #[tokio::test]
  async fn watched_read_fails_when_nothing_moves() {
    let (_tx, rx) = tokio::io::duplex(64);
    let mut watched = Watched::new(rx, Duration::from_millis(80));
    let mut buf = [0u8; 1];
    let err = watched.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
  }

  #[tokio::test]
  async fn rewind_replays_prefix_before_inner() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
  }

  #[tokio::test]
  async fn rewind_with_empty_prefix_is_transparent() {
    let inner: &[u8] = b"payload";
    let mut stream = Rewind::new(Bytes::new(), inner);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"payload");
  }
}
