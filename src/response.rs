use bytes::Bytes;
use http::Response as HttpResponse;
use tokio::io::AsyncBufRead;

use crate::body::{Body, Framing};
use crate::error::{new_io_error, Error, Result};
use crate::request::{
  read_headers, read_limited_line, reconcile_framing, wants_close, write_framed_body,
};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Longest status line we will accept.
const MAX_STATUS_LINE: usize = 8192;

/// One parsed HTTP/1 response flowing back through the proxy.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  status_code: http::StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
  framing: Framing,
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      framing: Framing::None,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// An HTTP response builder, for synthesized and short-circuit responses.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }

  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }

  /// Get the headers of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }

  /// Get the response body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Replace the response body; framing is reconciled at write time.
  #[inline]
  pub fn set_body<T: Into<Body>>(&mut self, body: T) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }

  /// The wire framing the origin used for the body.
  #[inline]
  pub fn framing(&self) -> Framing {
    self.framing
  }

  pub(crate) fn set_framing(&mut self, framing: Framing) {
    self.framing = framing;
  }

  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  /// Whether this response demands connection close.
  pub fn wants_close(&self) -> bool {
    // close-delimited bodies end the origin connection by definition
    self.framing == Framing::Close || wants_close(self.version, &self.headers)
  }

  /// Serialize for the client leg, reconciling framing with the body.
  ///
  /// Chunked responses are re-emitted as a single chunk plus terminator;
  /// everything else gets a recomputed content-length, so a body rewritten
  /// by `on_response` still frames correctly.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut out = Vec::new();
    out.extend(format!("{:?}", self.version).as_bytes());
    out.extend(SPACE);
    out.extend(format!("{}", self.status_code).as_bytes());
    out.extend(CR_LF);

    let mut headers = self.headers.clone();
    let framing = match self.framing {
      // the captured length replaces close-delimiting, so the client leg
      // can stay open even when the origin leg closes
      Framing::Close => Framing::ContentLength(0),
      other => other,
    };
    reconcile_framing(
      &mut headers,
      framing,
      self.body.as_deref().map(|b| b.len()),
    );
    for (k, v) in headers.iter() {
      out.extend(k.as_str().as_bytes());
      out.extend(COLON_SPACE);
      out.extend(v.as_bytes());
      out.extend(CR_LF);
    }
    out.extend(CR_LF);
    write_framed_body(&mut out, framing, self.body.as_deref());
    Bytes::from(out)
  }
}

/// Head of a response whose body has not been read yet.
#[derive(Debug)]
pub(crate) struct ResponseHead {
  pub version: http::Version,
  pub status: http::StatusCode,
  pub headers: http::HeaderMap<http::HeaderValue>,
}

impl ResponseHead {
  /// Body framing announced by the head, relative to the request method.
  pub fn framing(&self, request_method: &http::Method) -> Framing {
    Framing::of_response(request_method, self.status, &self.headers)
  }

  /// Assemble a full [`Response`] once the body is captured.
  pub fn into_response(self, framing: Framing, body: Option<Body>) -> Response {
    Response {
      version: self.version,
      status_code: self.status,
      headers: self.headers,
      body,
      framing,
    }
  }
}

/// Read a status line plus headers from the origin leg.
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_limited_line(reader, &mut line, MAX_STATUS_LINE).await?;
  if n == 0 {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "origin closed before sending a status line",
    ));
  }
  let (version, status) = parse_status_line(&line)?;
  let headers = read_headers(reader).await?;
  Ok(ResponseHead {
    version,
    status,
    headers,
  })
}

fn parse_status_line(line: &[u8]) -> Result<(http::Version, http::StatusCode)> {
  let mut version = None;
  let mut status = None;
  for (index, part) in line.splitn(3, |b| *b == b' ').enumerate() {
    match index {
      0 => {
        version = Some(match part {
          b"HTTP/1.0" => http::Version::HTTP_10,
          b"HTTP/1.1" => http::Version::HTTP_11,
          _ => {
            return Err(new_io_error(
              std::io::ErrorKind::InvalidData,
              "invalid http version in status line",
            ));
          }
        });
      }
      1 => {
        let part = part.strip_suffix(CR_LF).unwrap_or(part);
        let part = part.strip_suffix(b"\n").unwrap_or(part);
        status = Some(http::StatusCode::try_from(part).map_err(Error::from)?);
      }
      _ => {}
    }
  }
  match (version, status) {
    (Some(v), Some(s)) => Ok((v, s)),
    _ => Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "invalid status line",
    )),
  }
}
