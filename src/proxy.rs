//! Listener front end: configuration, accept loop, and shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::ca::CertificateAuthority;
use crate::conn::ConnectionHandler;
use crate::error::Result;
use crate::handler::{HandlerChain, HandlerSet};

/// Default body capture ceiling: 4 MiB.
const DEFAULT_MAX_BODY_CAPTURE: usize = 4 * 1024 * 1024;

/// Tunables for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Address to listen on.
  pub listen: SocketAddr,
  /// PEM file holding the root CA certificate, if any.
  pub ca_cert_path: Option<PathBuf>,
  /// PEM file holding the root CA private key, if any.
  pub ca_key_path: Option<PathBuf>,
  /// Largest body the relay will buffer for inspection; bigger bodies
  /// stream through uninspected.
  pub max_body_capture: usize,
  /// How long a read or write on either leg may stall.
  pub idle_timeout: Duration,
  /// How long an origin dial may take.
  pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
      ca_cert_path: None,
      ca_key_path: None,
      max_body_capture: DEFAULT_MAX_BODY_CAPTURE,
      idle_timeout: Duration::from_secs(60),
      connect_timeout: Duration::from_secs(10),
    }
  }
}

/// Requests a running listener to stop accepting and drain.
#[derive(Clone)]
pub struct ShutdownHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
  /// Stop accepting new connections; in-flight ones finish normally.
  pub fn shutdown(&self) {
    let _ = self.tx.send(true);
  }
}

/// The intercepting proxy, configured but not yet bound.
pub struct ProxyListener {
  config: Arc<ProxyConfig>,
  ca: Arc<CertificateAuthority>,
  chain: HandlerChain,
  tls_client: Arc<ClientConfig>,
  shutdown_tx: Arc<watch::Sender<bool>>,
  shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
  /// Build a proxy from a config and a handler set.
  ///
  /// The root CA is loaded from the configured files; any failure there is
  /// recoverable and falls back to a fresh in-memory root. Only failing to
  /// generate that fallback is fatal.
  pub async fn new(config: ProxyConfig, handlers: HandlerSet) -> Result<Self> {
    let ca = match (&config.ca_cert_path, &config.ca_key_path) {
      (Some(cert), Some(key)) => match CertificateAuthority::load_root(cert, key).await {
        Ok(ca) => ca,
        Err(error) => {
          tracing::warn!(%error, "loading CA files failed, using an ephemeral root instead");
          CertificateAuthority::ephemeral()?
        }
      },
      _ => {
        tracing::info!("no CA files configured, using an ephemeral root");
        CertificateAuthority::ephemeral()?
      }
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Ok(Self {
      config: Arc::new(config),
      ca: Arc::new(ca),
      chain: HandlerChain::new(handlers),
      tls_client: Arc::new(native_tls_client()),
      shutdown_tx: Arc::new(shutdown_tx),
      shutdown_rx,
    })
  }

  /// The certificate authority in use, e.g. to export its root.
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Root certificate in PEM form, for client trust stores.
  pub fn root_cert_pem(&self) -> &str {
    self.ca.root_cert_pem()
  }

  /// A handle that stops the accept loop when triggered.
  pub fn shutdown_handle(&self) -> ShutdownHandle {
    ShutdownHandle {
      tx: self.shutdown_tx.clone(),
    }
  }

  /// Bind the listening socket without starting to accept.
  ///
  /// Splitting bind from serve lets callers learn the bound address first,
  /// which matters when listening on port 0.
  pub async fn bind(self) -> Result<BoundProxy> {
    let listener = TcpListener::bind(self.config.listen).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "proxy listening");
    Ok(BoundProxy {
      listener,
      local_addr,
      proxy: self,
    })
  }

  /// Bind and serve until shut down.
  pub async fn run(self) -> Result<()> {
    self.bind().await?.serve().await
  }
}

/// A proxy with its listening socket bound, ready to accept.
pub struct BoundProxy {
  listener: TcpListener,
  local_addr: SocketAddr,
  proxy: ProxyListener,
}

impl BoundProxy {
  /// The address actually bound.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Accept connections until the shutdown handle fires, then drain.
  ///
  /// Per-connection failures never escape their task; the accept loop runs
  /// until told to stop.
  pub async fn serve(self) -> Result<()> {
    let BoundProxy {
      listener, proxy, ..
    } = self;
    let mut shutdown = proxy.shutdown_rx.clone();
    let mut connections = JoinSet::new();
    loop {
      tokio::select! {
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              stream.set_nodelay(true).ok();
              tracing::debug!(%peer, "accepted");
              let handler = ConnectionHandler::new(
                proxy.config.clone(),
                proxy.ca.clone(),
                proxy.chain.clone(),
                proxy.tls_client.clone(),
                peer,
              );
              connections.spawn(handler.serve(stream));
            }
            Err(error) => {
              tracing::warn!(%error, "accept failed");
            }
          }
        }
        _ = shutdown.changed() => break,
      }
      // reap finished connection tasks as we go
      while connections.try_join_next().is_some() {}
    }
    tracing::info!("shutting down, draining in-flight connections");
    while connections.join_next().await.is_some() {}
    Ok(())
  }
}

/// TLS client configuration for the origin leg, trusting the platform's
/// native root store.
fn native_tls_client() -> ClientConfig {
  let mut roots = RootCertStore::empty();
  let loaded = rustls_native_certs::load_native_certs();
  for error in &loaded.errors {
    tracing::debug!(%error, "skipping unreadable native root certificate");
  }
  for cert in loaded.certs {
    roots.add(cert).ok();
  }
  let mut config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  // we only speak HTTP/1.1 toward the origin
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  config
}
