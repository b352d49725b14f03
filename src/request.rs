use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::{Body, Framing};
use crate::error::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Longest request line we will accept.
const MAX_REQUEST_LINE: usize = 8192;
/// Cap on the total header section.
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// One parsed HTTP/1 request flowing through the proxy.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  framing: Framing,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      framing: Framing::of_request(&parts.headers),
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`.
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Get the HTTP method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Get the URI for this request.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }

  /// Get a mutable reference to the URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }

  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the request body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Replace the request body; framing is reconciled at write time.
  #[inline]
  pub fn set_body<T: Into<Body>>(&mut self, body: T) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }

  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The wire framing the client used for the body.
  #[inline]
  pub fn framing(&self) -> Framing {
    self.framing
  }

  pub(crate) fn set_framing(&mut self, framing: Framing) {
    self.framing = framing;
  }

  /// Whether this request (or its HTTP version) demands connection close.
  pub fn wants_close(&self) -> bool {
    wants_close(self.version, &self.headers)
  }

  /// Target host and port, from the URI authority, with a scheme default.
  pub fn host_port(&self) -> Result<(String, u16)> {
    let authority = self
      .uri
      .authority()
      .ok_or_else(|| Error::invalid_request("request URI has no authority"))?;
    let default_port = match self.uri.scheme_str() {
      Some("https") => 443,
      _ => 80,
    };
    Ok((
      authority.host().to_string(),
      authority.port_u16().unwrap_or(default_port),
    ))
  }

  /// Serialize for the origin leg, reconciling framing with the body.
  ///
  /// Always origin-form: we dial the origin ourselves, so the absolute
  /// form a proxy client sent is rewritten to path + Host.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut out = Vec::new();
    out.extend(self.method.as_str().as_bytes());
    out.extend(SPACE);
    let path = if self.uri.path().is_empty() {
      "/"
    } else {
      self.uri.path()
    };
    out.extend(path.as_bytes());
    if let Some(q) = self.uri.query() {
      out.extend(b"?");
      out.extend(q.as_bytes());
    }
    out.extend(SPACE);
    out.extend(format!("{:?}", self.version).as_bytes());
    out.extend(CR_LF);

    let mut headers = self.headers.clone();
    if !headers.contains_key(http::header::HOST) {
      if let Some(a) = self.uri.authority() {
        headers.insert(
          http::header::HOST,
          HeaderValue::from_str(a.as_str()).unwrap_or(HeaderValue::from_static("")),
        );
      }
    }
    reconcile_framing(&mut headers, self.framing, self.body.as_deref().map(|b| b.len()));
    for (k, v) in headers.iter() {
      out.extend(k.as_str().as_bytes());
      out.extend(COLON_SPACE);
      out.extend(v.as_bytes());
      out.extend(CR_LF);
    }
    out.extend(CR_LF);
    write_framed_body(&mut out, self.framing, self.body.as_deref());
    Bytes::from(out)
  }
}

/// Head of a request whose body has not been read yet.
#[derive(Debug)]
pub(crate) struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap<HeaderValue>,
}

impl RequestHead {
  /// Body framing announced by the head.
  pub fn framing(&self) -> Framing {
    Framing::of_request(&self.headers)
  }

  /// Assemble a full [`Request`] once the URI is resolved and the body
  /// captured.
  pub fn into_request(self, uri: http::Uri, body: Option<Body>) -> Request {
    let framing = self.framing();
    Request {
      uri,
      version: self.version,
      method: self.method,
      headers: self.headers,
      body,
      framing,
    }
  }
}

/// Read one line into `buf`, erroring once `limit` bytes arrive without a
/// newline. A plain `read_until` would buffer the whole line first, which
/// lets a peer grow memory unboundedly before any size check runs.
pub(crate) async fn read_limited_line<R>(
  reader: &mut R,
  buf: &mut Vec<u8>,
  limit: usize,
) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let mut bounded = (&mut *reader).take(limit as u64);
  let n = bounded.read_until(b'\n', buf).await?;
  if n == limit && !buf.ends_with(b"\n") {
    return Err(Error::invalid_request("line too long"));
  }
  Ok(n)
}

/// Read a request line plus headers from the client leg.
///
/// `Ok(None)` means the peer closed cleanly between requests.
pub(crate) async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_limited_line(reader, &mut line, MAX_REQUEST_LINE).await?;
  if n == 0 {
    return Ok(None);
  }
  let line_str = String::from_utf8_lossy(&line);
  let mut parts = line_str.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::invalid_request("invalid request line")),
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid method {method:?}")))?;
  let version = parse_version(version)?;
  let headers = read_headers(reader).await?;
  Ok(Some(RequestHead {
    method,
    target: target.to_string(),
    version,
    headers,
  }))
}

pub(crate) fn parse_version(v: &str) -> Result<Version> {
  match v {
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request(format!("unsupported version {v:?}"))),
  }
}

/// Read header lines up to the blank separator.
pub(crate) async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap<HeaderValue>>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0usize;
  loop {
    header_line.clear();
    if total >= MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("header section too large"));
    }
    let length = read_limited_line(reader, &mut header_line, MAX_HEADERS_SIZE - total).await?;
    if length == 0 || header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    total += length;
    if let (Some(k), Some(v)) = parse_header(&header_line)? {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
  }
  Ok(headers)
}

pub(crate) fn parse_header(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<HeaderValue>)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let mut split = buffer.splitn(2, |b| *b == b':');
  let name = match split.next() {
    Some(name) if !name.is_empty() => http::HeaderName::from_bytes(name)
      .map_err(|e| Error::Http(http::Error::from(e)))?,
    _ => return Ok((None, None)),
  };
  let value = match split.next() {
    Some(value) => {
      let value = value.strip_prefix(SPACE).unwrap_or(value);
      HeaderValue::from_bytes(value).map_err(Error::from)?
    }
    None => return Ok((Some(name), None)),
  };
  Ok((Some(name), Some(value)))
}

/// Rewrite content-length / transfer-encoding so the header section agrees
/// with the (possibly rewritten) body that will follow it.
pub(crate) fn reconcile_framing(
  headers: &mut HeaderMap<HeaderValue>,
  framing: Framing,
  body_len: Option<usize>,
) {
  match framing {
    Framing::Chunked => {
      headers.remove(http::header::CONTENT_LENGTH);
      headers.insert(
        http::header::TRANSFER_ENCODING,
        HeaderValue::from_static("chunked"),
      );
    }
    Framing::None => {
      headers.remove(http::header::TRANSFER_ENCODING);
      headers.remove(http::header::CONTENT_LENGTH);
    }
    Framing::ContentLength(_) | Framing::Close => {
      headers.remove(http::header::TRANSFER_ENCODING);
      match body_len {
        Some(len) => {
          headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        None => {
          headers.remove(http::header::CONTENT_LENGTH);
        }
      }
    }
  }
}

/// Append the body in its wire framing: one chunk + terminator for chunked,
/// plain bytes otherwise.
pub(crate) fn write_framed_body(out: &mut Vec<u8>, framing: Framing, body: Option<&Bytes>) {
  match framing {
    Framing::Chunked => {
      if let Some(b) = body {
        if !b.is_empty() {
          out.extend(format!("{:x}\r\n", b.len()).as_bytes());
          out.extend(b.as_ref());
          out.extend(CR_LF);
        }
      }
      out.extend(b"0\r\n\r\n");
    }
    _ => {
      if let Some(b) = body {
        out.extend(b.as_ref());
      }
    }
  }
}

pub(crate) fn wants_close(version: Version, headers: &HeaderMap<HeaderValue>) -> bool {
  let connection = headers
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase());
  match connection {
    Some(v) if v.contains("close") => true,
    Some(v) if v.contains("keep-alive") => false,
    _ => version == Version::HTTP_10,
  }
}
