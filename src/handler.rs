//! Inspection callback slots and their invocation contract.
//!
//! Host applications observe and rewrite traffic by implementing
//! [`Handlers`]: one trait with five optional hooks, each defaulting to a
//! no-op so the engine never has to null-check. The engine invokes hooks in
//! a fixed order per connection: `on_connect` before any `on_request`,
//! `on_request` before its matching `on_response`, `on_error` whenever a
//! recoverable failure occurs.
//!
//! A panicking callback must not take the connection handler down with it:
//! every hook call is wrapped so a panic surfaces as a `CallbackFailure`
//! through the `on_error` path instead.

use crate::error::{Error, ErrorKind};
use crate::request::Request;
use crate::response::Response;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// What to do with a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
  /// Terminate TLS with a forged certificate and inspect the plaintext.
  Mitm,
  /// Relay raw bytes both ways without parsing.
  Forward,
  /// Refuse the tunnel.
  Reject,
}

/// Outcome of the `on_connect` hook: the action plus the (possibly
/// rewritten) host to dial.
#[derive(Debug, Clone)]
pub struct ConnectDecision {
  /// chosen tunnel treatment
  pub action: ConnectAction,
  /// target host, possibly rewritten by the callback
  pub host: String,
}

impl ConnectDecision {
  /// The default decision: intercept, host unchanged.
  pub fn mitm(host: impl Into<String>) -> Self {
    Self {
      action: ConnectAction::Mitm,
      host: host.into(),
    }
  }

  /// Relay the tunnel blindly, host unchanged.
  pub fn forward(host: impl Into<String>) -> Self {
    Self {
      action: ConnectAction::Forward,
      host: host.into(),
    }
  }

  /// Refuse the tunnel.
  pub fn reject(host: impl Into<String>) -> Self {
    Self {
      action: ConnectAction::Reject,
      host: host.into(),
    }
  }
}

/// Pipeline stage at which an error occurred, passed to `on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// accepting / classifying the inbound connection
  Accept,
  /// CONNECT negotiation
  Connect,
  /// TLS handshake with the client
  ClientHandshake,
  /// dialing the origin
  OriginDial,
  /// TLS handshake with the origin
  OriginHandshake,
  /// reading / inspecting the request
  Request,
  /// reading / inspecting the response
  Response,
  /// blind tunnel relay
  Tunnel,
  /// inside a host-supplied callback
  Callback,
}

/// Per-connection state visible to callbacks.
///
/// Created when the connection is accepted, dropped when it closes.
#[derive(Debug, Clone)]
pub struct InterceptContext {
  /// client address
  pub peer: SocketAddr,
  /// negotiated tunnel treatment, `None` before `on_connect` (and for
  /// plain HTTP connections)
  pub action: Option<ConnectAction>,
  /// tunnel target host, once known
  pub host: Option<String>,
  /// whether the origin leg uses TLS
  pub https: bool,
  /// ordinal of the request currently in flight on this connection
  pub request_ordinal: u64,
  /// display form of the last error reported via `on_error`
  pub last_error: Option<String>,
}

impl InterceptContext {
  pub(crate) fn new(peer: SocketAddr) -> Self {
    Self {
      peer,
      action: None,
      host: None,
      https: false,
      request_ordinal: 0,
      last_error: None,
    }
  }
}

/// The five optional inspection hooks.
///
/// Every method has a no-op default, so an implementor overrides only what
/// it needs; [`NoopHandlers`] supplies the all-default set.
#[async_trait::async_trait]
pub trait Handlers: Send + Sync {
  /// Called for every plain (non-tunneled) request before any proxy logic.
  ///
  /// Returning `Some(response)` means the callback served the request
  /// itself; the engine writes that response and performs no forwarding.
  async fn on_accept(&self, ctx: &mut InterceptContext, req: &Request) -> Option<Response> {
    let _ = (ctx, req);
    None
  }

  /// Called once per CONNECT tunnel to pick its treatment.
  ///
  /// The default intercepts every host and never rewrites it.
  async fn on_connect(&self, ctx: &mut InterceptContext, host: &str) -> ConnectDecision {
    let _ = ctx;
    ConnectDecision::mitm(host)
  }

  /// Called once per request, after headers and the captured body are
  /// available. Returning `Some(response)` short-circuits the origin dial.
  async fn on_request(&self, ctx: &mut InterceptContext, req: &mut Request) -> Option<Response> {
    let _ = (ctx, req);
    None
  }

  /// Called once per origin response before it is relayed back; headers
  /// and body may be mutated in place.
  async fn on_response(&self, ctx: &mut InterceptContext, req: &Request, resp: &mut Response) {
    let _ = (ctx, req, resp);
  }

  /// Called on any recoverable failure, for observability only.
  async fn on_error(&self, ctx: &InterceptContext, phase: Phase, kind: ErrorKind, error: &Error) {
    let _ = (ctx, phase, kind, error);
  }
}

/// The null-object handler set: every hook falls through to its default.
pub struct NoopHandlers;

#[async_trait::async_trait]
impl Handlers for NoopHandlers {}

/// Engine-side wrapper that invokes hooks with panic isolation.
#[derive(Clone)]
pub struct HandlerChain {
  inner: Arc<dyn Handlers>,
}

impl HandlerChain {
  /// Wrap a handler set.
  pub fn new(inner: Arc<dyn Handlers>) -> Self {
    Self { inner }
  }

  pub(crate) async fn accept(&self, ctx: &mut InterceptContext, req: &Request) -> Option<Response> {
    match AssertUnwindSafe(self.inner.on_accept(ctx, req))
      .catch_unwind()
      .await
    {
      Ok(resp) => resp,
      Err(panic) => {
        self.report_panic(ctx, Phase::Accept, panic).await;
        None
      }
    }
  }

  pub(crate) async fn connect(&self, ctx: &mut InterceptContext, host: &str) -> ConnectDecision {
    match AssertUnwindSafe(self.inner.on_connect(ctx, host))
      .catch_unwind()
      .await
    {
      Ok(decision) => decision,
      Err(panic) => {
        self.report_panic(ctx, Phase::Connect, panic).await;
        ConnectDecision::mitm(host)
      }
    }
  }

  pub(crate) async fn request(
    &self,
    ctx: &mut InterceptContext,
    req: &mut Request,
  ) -> Option<Response> {
    match AssertUnwindSafe(self.inner.on_request(ctx, req))
      .catch_unwind()
      .await
    {
      Ok(resp) => resp,
      Err(panic) => {
        self.report_panic(ctx, Phase::Request, panic).await;
        None
      }
    }
  }

  pub(crate) async fn response(
    &self,
    ctx: &mut InterceptContext,
    req: &Request,
    resp: &mut Response,
  ) {
    if let Err(panic) = AssertUnwindSafe(self.inner.on_response(ctx, req, resp))
      .catch_unwind()
      .await
    {
      self.report_panic(ctx, Phase::Response, panic).await;
    }
  }

  /// Report an error through `on_error`, recording it on the context.
  ///
  /// A panic inside `on_error` itself is only logged; there is nothing
  /// further to escalate to.
  pub(crate) async fn error(&self, ctx: &mut InterceptContext, phase: Phase, error: &Error) {
    ctx.last_error = Some(error.to_string());
    tracing::debug!(?phase, kind = ?error.kind(), %error, peer = %ctx.peer, "connection error");
    if AssertUnwindSafe(self.inner.on_error(ctx, phase, error.kind(), error))
      .catch_unwind()
      .await
      .is_err()
    {
      tracing::error!(?phase, "on_error callback panicked");
    }
  }

  async fn report_panic(
    &self,
    ctx: &mut InterceptContext,
    phase: Phase,
    panic: Box<dyn std::any::Any + Send>,
  ) {
    let msg = panic_message(panic);
    tracing::error!(?phase, %msg, "handler callback panicked");
    let err = Error::Callback(msg);
    self.error(ctx, Phase::Callback, &err).await;
  }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "opaque panic payload".to_string()
  }
}

/// Convenience alias kept for embedding applications.
pub type HandlerSet = Arc<dyn Handlers>;
