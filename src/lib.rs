#![deny(missing_docs)]
//! An intercepting HTTP/HTTPS proxy engine.
//!
//! `tapwire` accepts proxy-configured clients, classifies each CONNECT
//! tunnel, and can terminate TLS with a per-host forged certificate so the
//! plaintext exchange becomes visible to a set of inspection callbacks.
//! Bodies are captured into replayable buffers up to a configurable limit;
//! anything larger streams through untouched.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapwire::{NoopHandlers, ProxyConfig, ProxyListener};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tapwire::Error> {
//!   let proxy = ProxyListener::new(ProxyConfig::default(), Arc::new(NoopHandlers)).await?;
//!   proxy.run().await
//! }
//! ```

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const SPACE: &[u8] = b" ";
pub(crate) const COLON_SPACE: &[u8] = b": ";

mod body;
mod ca;
mod conn;
mod error;
mod handler;
mod proxy;
mod relay;
mod request;
mod response;
mod socket;

pub use body::{Body, Framing};
pub use ca::{CertificateAuthority, LeafCert};
pub use error::{Error, ErrorKind, Result};
pub use handler::{
  ConnectAction, ConnectDecision, HandlerChain, HandlerSet, Handlers, InterceptContext,
  NoopHandlers, Phase,
};
pub use proxy::{BoundProxy, ProxyConfig, ProxyListener, ShutdownHandle};
pub use relay::{capture, Capture, CapturedBody, Overflow};
pub use request::Request;
pub use response::Response;
