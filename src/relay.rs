//! Bounded capture and replay of HTTP message bodies.
//!
//! Network streams are single-read: once inspection code has consumed a
//! body, the original reader is useless to the next pipeline stage. The
//! relay therefore reads the whole body into an owned buffer (bounded by a
//! configurable maximum) and hands out fresh readers over those bytes, so
//! neither the client nor the origin can tell interception happened.
//!
//! When the bound is exceeded capture is abandoned rather than truncated:
//! the caller gets back the exact wire bytes consumed so far plus enough
//! framing information to pump the remainder through untouched.

use crate::body::{Body, Framing};
use crate::error::{Error, Result};
use crate::request::read_limited_line;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest chunk-size line (digits plus extensions) we will accept.
const MAX_CHUNK_SIZE_LINE: usize = 1024;
/// Cap on the trailer section after the terminal chunk.
const MAX_TRAILERS_SIZE: usize = 16 * 1024;

/// A fully buffered message body plus its original wire framing.
#[derive(Debug, Clone)]
pub struct CapturedBody {
  bytes: Bytes,
  framing: Framing,
}

impl CapturedBody {
  /// The captured payload bytes (chunked framing already decoded).
  pub fn bytes(&self) -> &Bytes {
    &self.bytes
  }

  /// The framing the peer used on the wire.
  pub fn framing(&self) -> Framing {
    self.framing
  }

  /// Whether the message carried any payload at all.
  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  /// Captured length in bytes.
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  /// A fresh readable stream over the captured bytes.
  ///
  /// Reading from it never disturbs the capture; it can be handed to a
  /// downstream consumer in place of the original stream.
  pub fn reader(&self) -> std::io::Cursor<Bytes> {
    std::io::Cursor::new(self.bytes.clone())
  }

  /// Convert into an engine [`Body`], `None` when empty.
  pub fn into_body(self) -> Option<Body> {
    if self.bytes.is_empty() {
      None
    } else {
      Some(Body::from(self.bytes))
    }
  }
}

/// Outcome of a capture attempt.
pub enum Capture {
  /// The whole body fit under the limit.
  Complete(CapturedBody),
  /// The body was too large; capture was abandoned at a framing boundary.
  Overflow(Overflow),
}

/// State left behind by an abandoned capture.
///
/// Holds the raw wire bytes already consumed and knows how to pump the
/// remainder of the body from the reader to a writer without inspecting it,
/// leaving the byte stream exactly as the peer produced it.
pub struct Overflow {
  raw_prefix: Vec<u8>,
  // data still owed for a chunk whose size line is already in the prefix
  pending_data: u64,
  rest: Framing,
  limit: usize,
}

impl Overflow {
  /// The configured limit that was exceeded.
  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Forward the already-consumed prefix plus the rest of the body,
  /// untouched, from `reader` to `writer`. Returns the bytes written.
  pub async fn relay_to<R, W>(self, reader: &mut R, writer: &mut W) -> Result<u64>
  where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
  {
    let mut written = self.raw_prefix.len() as u64;
    writer.write_all(&self.raw_prefix).await?;
    if self.pending_data > 0 {
      written += tokio::io::copy(&mut reader.take(self.pending_data), writer).await?;
      // the CRLF closing that chunk, before the parser resumes
      written += tokio::io::copy(&mut reader.take(2), writer).await?;
    }
    match self.rest {
      Framing::None => {}
      Framing::ContentLength(n) => {
        written += tokio::io::copy(&mut reader.take(n), writer).await?;
      }
      Framing::Chunked => {
        written += copy_chunked(reader, writer).await?;
      }
      Framing::Close => {
        written += tokio::io::copy(reader, writer).await?;
      }
    }
    writer.flush().await?;
    Ok(written)
  }
}

/// Stream one body from `reader` to `writer` per its framing, uninspected
/// and unbuffered.
pub(crate) async fn passthrough<R, W>(
  reader: &mut R,
  writer: &mut W,
  framing: Framing,
) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let written = match framing {
    Framing::None => 0,
    Framing::ContentLength(n) => tokio::io::copy(&mut reader.take(n), writer).await?,
    Framing::Chunked => copy_chunked(reader, writer).await?,
    Framing::Close => tokio::io::copy(reader, writer).await?,
  };
  writer.flush().await?;
  Ok(written)
}

/// Read one body to completion according to its framing, bounded by `max`.
///
/// On success the returned [`CapturedBody`] holds the decoded payload and a
/// replacement stream can be minted from it at will. On overflow nothing is
/// lost: the consumed prefix is preserved verbatim and the stream remains
/// positioned at a framing boundary.
pub async fn capture<R>(reader: &mut R, framing: Framing, max: usize) -> Result<Capture>
where
  R: AsyncBufRead + Unpin,
{
  match framing {
    Framing::None => Ok(Capture::Complete(CapturedBody {
      bytes: Bytes::new(),
      framing,
    })),
    Framing::ContentLength(n) => {
      if n > max as u64 {
        // Nothing consumed yet; the whole body streams through untouched.
        return Ok(Capture::Overflow(Overflow {
          raw_prefix: Vec::new(),
          pending_data: 0,
          rest: framing,
          limit: max,
        }));
      }
      let mut buf = vec![0u8; n as usize];
      reader.read_exact(&mut buf).await?;
      Ok(Capture::Complete(CapturedBody {
        bytes: buf.into(),
        framing,
      }))
    }
    Framing::Chunked => capture_chunked(reader, max).await,
    Framing::Close => {
      let mut buf = Vec::new();
      let mut chunk = [0u8; 8192];
      loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
          break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max {
          return Ok(Capture::Overflow(Overflow {
            raw_prefix: buf,
            pending_data: 0,
            rest: Framing::Close,
            limit: max,
          }));
        }
      }
      Ok(Capture::Complete(CapturedBody {
        bytes: buf.into(),
        framing,
      }))
    }
  }
}

async fn capture_chunked<R>(reader: &mut R, max: usize) -> Result<Capture>
where
  R: AsyncBufRead + Unpin,
{
  let mut raw = Vec::new();
  let mut decoded = Vec::new();
  loop {
    let size = read_chunk_size(reader, &mut raw).await?;
    if size == 0 {
      read_trailers(reader, &mut raw).await?;
      return Ok(Capture::Complete(CapturedBody {
        bytes: decoded.into(),
        framing: Framing::Chunked,
      }));
    }
    // The declared size is untrusted input; abandon capture before it
    // can buy an allocation the limit does not allow. The unread chunk
    // data travels as pending bytes so relay_to resumes at a size line.
    if size > (max - decoded.len()) as u64 {
      return Ok(Capture::Overflow(Overflow {
        raw_prefix: raw,
        pending_data: size,
        rest: Framing::Chunked,
        limit: max,
      }));
    }
    let mut chunk = vec![0u8; size as usize + 2];
    reader.read_exact(&mut chunk).await?;
    if !chunk.ends_with(b"\r\n") {
      return Err(Error::invalid_request("chunk data missing CRLF"));
    }
    decoded.extend_from_slice(&chunk[..size as usize]);
    raw.extend_from_slice(&chunk);
  }
}

/// Copy a chunked body through without buffering it, terminator included.
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut written = 0u64;
  loop {
    let mut line = Vec::new();
    let size = read_chunk_size(reader, &mut line).await?;
    writer.write_all(&line).await?;
    written += line.len() as u64;
    if size == 0 {
      let mut trailers = Vec::new();
      read_trailers(reader, &mut trailers).await?;
      writer.write_all(&trailers).await?;
      written += trailers.len() as u64;
      return Ok(written);
    }
    written += tokio::io::copy(&mut reader.take(size), writer).await?;
    written += tokio::io::copy(&mut reader.take(2), writer).await?;
  }
}

/// Read a chunk-size line, appending the raw line to `raw`.
///
/// Chunk extensions (anything after `;`) are tolerated and ignored.
async fn read_chunk_size<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
{
  let start = raw.len();
  let n = read_limited_line(reader, raw, MAX_CHUNK_SIZE_LINE).await?;
  if n == 0 {
    return Err(Error::invalid_request("unexpected EOF in chunked body"));
  }
  let line = &raw[start..];
  let line = std::str::from_utf8(line)
    .map_err(|_| Error::invalid_request("non-ascii chunk size"))?
    .trim_end_matches(['\r', '\n']);
  let size_part = line.split(';').next().unwrap_or_default().trim();
  u64::from_str_radix(size_part, 16)
    .map_err(|_| Error::invalid_request(format!("invalid chunk size {size_part:?}")))
}

/// Consume trailer lines after the terminal chunk, up to and including the
/// blank line.
async fn read_trailers<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  // raw also holds chunk data, so the trailer budget is tracked apart
  let mut section = 0usize;
  loop {
    let start = raw.len();
    let n = read_limited_line(reader, raw, MAX_TRAILERS_SIZE - section).await?;
    if n == 0 {
      return Err(Error::invalid_request("unexpected EOF in trailers"));
    }
    let line = &raw[start..];
    if line == b"\r\n" || line == b"\n" {
      return Ok(());
    }
    section += n;
    if section >= MAX_TRAILERS_SIZE {
      return Err(Error::invalid_request("trailer section too large"));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, BufReader};

  #[tokio::test]
  async fn capture_fixed_length_replays_identical_bytes() {
    let payload = b"hello intercepted world";
    let mut reader = BufReader::new(&payload[..]);
    let capture = capture(&mut reader, Framing::ContentLength(payload.len() as u64), 1024)
      .await
      .unwrap();
    let body = match capture {
      Capture::Complete(body) => body,
      Capture::Overflow(_) => panic!("unexpected overflow"),
    };
    assert_eq!(body.bytes().as_ref(), payload);

    let mut replayed = Vec::new();
    body.reader().read_to_end(&mut replayed).await.unwrap();
    assert_eq!(replayed, payload);
    // replay is repeatable
    let mut again = Vec::new();
    body.reader().read_to_end(&mut again).await.unwrap();
    assert_eq!(again, payload);
  }

  #[tokio::test]
  async fn capture_empty_body_replays_zero_bytes() {
    let mut reader = BufReader::new(&b""[..]);
    let capture = capture(&mut reader, Framing::None, 1024).await.unwrap();
    let body = match capture {
      Capture::Complete(body) => body,
      Capture::Overflow(_) => panic!("unexpected overflow"),
    };
    assert!(body.is_empty());
    let mut replayed = Vec::new();
    body.reader().read_to_end(&mut replayed).await.unwrap();
    assert!(replayed.is_empty());
  }

  #[tokio::test]
  async fn capture_decodes_chunked_body() {
    let wire = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Chunked, 1024).await.unwrap();
    match capture {
      Capture::Complete(body) => {
        assert_eq!(body.bytes().as_ref(), b"Wikipedia");
        assert_eq!(body.framing(), Framing::Chunked);
      }
      Capture::Overflow(_) => panic!("unexpected overflow"),
    }
  }

  #[tokio::test]
  async fn capture_reads_close_delimited_body_to_eof() {
    let wire = b"no framing at all";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Close, 1024).await.unwrap();
    match capture {
      Capture::Complete(body) => assert_eq!(body.bytes().as_ref(), wire),
      Capture::Overflow(_) => panic!("unexpected overflow"),
    }
  }

  #[tokio::test]
  async fn oversized_fixed_body_passes_through_intact() {
    let payload = b"0123456789abcdef";
    let mut reader = BufReader::new(&payload[..]);
    let capture = capture(&mut reader, Framing::ContentLength(payload.len() as u64), 4)
      .await
      .unwrap();
    let overflow = match capture {
      Capture::Complete(_) => panic!("expected overflow"),
      Capture::Overflow(o) => o,
    };
    let mut forwarded = Vec::new();
    let written = overflow.relay_to(&mut reader, &mut forwarded).await.unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(forwarded, payload);
  }

  #[tokio::test]
  async fn oversized_chunked_body_passes_through_byte_for_byte() {
    let wire = b"4\r\nWiki\r\n5\r\npedia\r\n3\r\n!!!\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Chunked, 5).await.unwrap();
    let overflow = match capture {
      Capture::Complete(_) => panic!("expected overflow"),
      Capture::Overflow(o) => o,
    };
    let mut forwarded = Vec::new();
    overflow.relay_to(&mut reader, &mut forwarded).await.unwrap();
    assert_eq!(forwarded, wire);
  }

  #[tokio::test]
  async fn absurd_chunk_size_abandons_capture_without_allocating() {
    // a declared size near u64::MAX must not buy an allocation
    let wire = b"ffffffffffffffff\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Chunked, 1024).await.unwrap();
    assert!(matches!(capture, Capture::Overflow(_)));
  }

  #[tokio::test]
  async fn oversized_first_chunk_passes_through_byte_for_byte() {
    let wire = b"20\r\nAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Chunked, 8).await.unwrap();
    let overflow = match capture {
      Capture::Complete(_) => panic!("expected overflow"),
      Capture::Overflow(o) => o,
    };
    let mut forwarded = Vec::new();
    overflow.relay_to(&mut reader, &mut forwarded).await.unwrap();
    assert_eq!(forwarded, wire);
  }

  #[tokio::test]
  async fn unterminated_chunk_size_line_is_rejected() {
    let wire = vec![b'f'; 4096];
    let mut reader = BufReader::new(&wire[..]);
    assert!(capture(&mut reader, Framing::Chunked, 1024).await.is_err());
  }

  #[tokio::test]
  async fn chunk_extensions_are_ignored() {
    let wire = b"4;ext=1\r\nWiki\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let capture = capture(&mut reader, Framing::Chunked, 1024).await.unwrap();
    match capture {
      Capture::Complete(body) => assert_eq!(body.bytes().as_ref(), b"Wiki"),
      Capture::Overflow(_) => panic!("unexpected overflow"),
    }
  }
}
