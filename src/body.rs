use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use http::HeaderMap;

/// A body.
#[derive(Clone, Default, PartialEq)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

/// How a message body is delimited on the wire.
///
/// The framing travels with the captured body so a possibly-rewritten body
/// can be written back in the same style the peer chose: chunked stays
/// chunked, fixed-length gets its length recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
  /// No body at all (GET without content-length, 204, 304, HEAD responses).
  #[default]
  None,
  /// `Content-Length: n`
  ContentLength(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Delimited by connection close (HTTP/1.0 style responses).
  Close,
}

impl Framing {
  /// Determine request-body framing from the request headers.
  ///
  /// Requests never use close-delimited bodies; absent both headers there
  /// is no body.
  pub fn of_request(headers: &HeaderMap) -> Framing {
    if is_chunked(headers) {
      return Framing::Chunked;
    }
    match content_length(headers) {
      Some(0) | None => Framing::None,
      Some(n) => Framing::ContentLength(n),
    }
  }

  /// Determine response-body framing from the status line and headers.
  pub fn of_response(
    request_method: &http::Method,
    status: http::StatusCode,
    headers: &HeaderMap,
  ) -> Framing {
    if request_method == http::Method::HEAD
      || status == http::StatusCode::NO_CONTENT
      || status == http::StatusCode::NOT_MODIFIED
      || status.is_informational()
    {
      return Framing::None;
    }
    if is_chunked(headers) {
      return Framing::Chunked;
    }
    match content_length(headers) {
      Some(0) => Framing::None,
      Some(n) => Framing::ContentLength(n),
      None => Framing::Close,
    }
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.trim().parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{HeaderValue, Method, StatusCode};

  #[test]
  fn request_framing_prefers_chunked() {
    let mut headers = HeaderMap::new();
    headers.insert(
      http::header::TRANSFER_ENCODING,
      HeaderValue::from_static("chunked"),
    );
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("12"));
    assert_eq!(Framing::of_request(&headers), Framing::Chunked);
  }

  #[test]
  fn response_without_length_reads_to_close() {
    let headers = HeaderMap::new();
    assert_eq!(
      Framing::of_response(&Method::GET, StatusCode::OK, &headers),
      Framing::Close
    );
  }

  #[test]
  fn head_and_no_content_never_have_bodies() {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("42"));
    assert_eq!(
      Framing::of_response(&Method::HEAD, StatusCode::OK, &headers),
      Framing::None
    );
    assert_eq!(
      Framing::of_response(&Method::GET, StatusCode::NO_CONTENT, &headers),
      Framing::None
    );
  }
}
