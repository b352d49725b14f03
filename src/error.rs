//! engine error
use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `tapwire::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting traffic.
///
/// Every variant maps to one entry of the failure taxonomy: certificate
/// loading is recoverable (the listener falls back to an ephemeral root),
/// everything else is fatal to at most one connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The CA certificate or key could not be read or parsed.
  #[error("CA load failed: {0}")]
  CertLoad(String),
  /// Synthesizing or signing a leaf certificate failed.
  #[error("certificate signing failed: {0}")]
  CertSign(String),
  /// The origin server could not be reached.
  #[error("dial to {host} failed: {source}")]
  Dial {
    /// host:port we tried to reach
    host: String,
    /// underlying connect error
    source: io::Error,
  },
  /// TLS negotiation failed on either leg.
  #[error("TLS handshake failed: {0}")]
  Handshake(String),
  /// A captured body exceeded the configured maximum.
  #[error("captured body exceeds {limit} bytes")]
  BodyTooLarge {
    /// configured capture ceiling
    limit: usize,
  },
  /// An inspection callback panicked.
  #[error("handler callback failed: {0}")]
  Callback(String),
  /// The peer sent something that is not HTTP/1.x.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// A read or write stalled past the idle timeout.
  #[error("connection idle for more than {0:?}")]
  IdleTimeout(std::time::Duration),
}

/// Coarse classification handed to the `on_error` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// `Error::CertLoad`
  CertLoadFailure,
  /// `Error::CertSign`
  CertSignFailure,
  /// `Error::Dial`
  DialFailure,
  /// `Error::Handshake`
  HandshakeFailure,
  /// `Error::BodyTooLarge`
  BodyTooLarge,
  /// `Error::Callback`
  CallbackFailure,
  /// anything transport or protocol level
  Transport,
}

impl Error {
  /// Classify this error for the `on_error` callback.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::CertLoad(_) => ErrorKind::CertLoadFailure,
      Error::CertSign(_) => ErrorKind::CertSignFailure,
      Error::Dial { .. } => ErrorKind::DialFailure,
      Error::Handshake(_) => ErrorKind::HandshakeFailure,
      Error::BodyTooLarge { .. } => ErrorKind::BodyTooLarge,
      Error::Callback(_) => ErrorKind::CallbackFailure,
      Error::InvalidRequest(_) | Error::Io(_) | Error::Http(_) | Error::IdleTimeout(_) => {
        ErrorKind::Transport
      }
    }
  }

  pub(crate) fn cert_load(msg: impl Into<String>) -> Self {
    Error::CertLoad(msg.into())
  }

  pub(crate) fn cert_sign(msg: impl Into<String>) -> Self {
    Error::CertSign(msg.into())
  }

  pub(crate) fn handshake(msg: impl Into<String>) -> Self {
    Error::Handshake(msg.into())
  }

  pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}
