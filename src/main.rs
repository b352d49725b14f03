//! Command line front end: an intercepting proxy that logs what it sees.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tapwire::{
  Error, ErrorKind, Handlers, InterceptContext, Phase, ProxyConfig, ProxyListener, Request,
  Response,
};

#[derive(Parser, Debug)]
#[command(name = "tapwire", version, about = "TLS-intercepting HTTP proxy")]
struct Args {
  /// Port to listen on.
  #[arg(short, long, default_value_t = 8080)]
  port: u16,

  /// Root CA certificate in PEM form.
  #[arg(long, default_value = "cert.pem")]
  ca_cert: PathBuf,

  /// Root CA private key in PEM form.
  #[arg(long, default_value = "key.pem")]
  ca_key: PathBuf,

  /// Log request and response bodies, not just heads.
  #[arg(long)]
  log_bodies: bool,
}

/// Handler set that logs traffic and tags responses it relayed.
struct LoggingHandlers {
  log_bodies: bool,
}

#[async_trait::async_trait]
impl Handlers for LoggingHandlers {
  async fn on_request(&self, ctx: &mut InterceptContext, req: &mut Request) -> Option<Response> {
    tracing::info!(
      peer = %ctx.peer,
      ordinal = ctx.request_ordinal,
      https = ctx.https,
      "{} {}",
      req.method(),
      req.uri()
    );
    if self.log_bodies {
      if let Some(body) = req.body() {
        tracing::info!(len = body.len(), "request body: {:?}", body);
      }
    }
    None
  }

  async fn on_response(&self, ctx: &mut InterceptContext, req: &Request, resp: &mut Response) {
    tracing::info!(
      peer = %ctx.peer,
      "{} {} -> {}",
      req.method(),
      req.uri(),
      resp.status_code()
    );
    if self.log_bodies {
      if let Some(body) = resp.body() {
        tracing::info!(len = body.len(), "response body: {:?}", body);
      }
    }
    resp
      .headers_mut()
      .insert(http::header::VIA, http::HeaderValue::from_static("tapwire"));
  }

  async fn on_error(&self, ctx: &InterceptContext, phase: Phase, kind: ErrorKind, error: &Error) {
    tracing::warn!(peer = %ctx.peer, ?phase, ?kind, %error, "proxy error");
  }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let args = Args::parse();
  let config = ProxyConfig {
    listen: ([0, 0, 0, 0], args.port).into(),
    ca_cert_path: Some(args.ca_cert),
    ca_key_path: Some(args.ca_key),
    ..ProxyConfig::default()
  };
  let handlers = Arc::new(LoggingHandlers {
    log_bodies: args.log_bodies,
  });

  let proxy = ProxyListener::new(config, handlers).await?;
  let shutdown = proxy.shutdown_handle();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("interrupt received, shutting down");
      shutdown.shutdown();
    }
  });
  proxy.run().await
}
