//! Per-connection engine: classification, tunneling, and the request loop.
//!
//! Each accepted socket gets one [`ConnectionHandler`]. Plain HTTP requests
//! are proxied directly; a CONNECT is classified by the `on_connect` hook
//! into interception (terminate TLS with a forged leaf, parse the
//! plaintext), blind forwarding, or rejection. Both the plain and the
//! intercepted paths share one request loop that captures bodies, runs the
//! inspection hooks, and keeps the client and origin legs alive across
//! requests where HTTP/1.1 semantics allow it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::body::Framing;
use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::handler::{ConnectAction, HandlerChain, InterceptContext, Phase};
use crate::proxy::ProxyConfig;
use crate::relay::{self, Capture};
use crate::request::{read_request_head, Request, RequestHead};
use crate::response::{read_response_head, Response, ResponseHead};
use crate::socket::{MaybeTlsStream, Rewind, Watched};
use crate::{COLON_SPACE, CR_LF, SPACE};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Body served by the built-in identification endpoint.
const INFO_BODY: &str = "This is tapwire.";

/// An open connection to one origin, reused across requests while both
/// sides keep the connection alive.
struct OriginLink {
  host: String,
  port: u16,
  tls: bool,
  stream: BufReader<MaybeTlsStream>,
}

/// Engine state for a single accepted client connection.
pub(crate) struct ConnectionHandler {
  config: Arc<ProxyConfig>,
  ca: Arc<CertificateAuthority>,
  chain: HandlerChain,
  connector: TlsConnector,
  ctx: InterceptContext,
  origin: Option<OriginLink>,
}

impl ConnectionHandler {
  pub(crate) fn new(
    config: Arc<ProxyConfig>,
    ca: Arc<CertificateAuthority>,
    chain: HandlerChain,
    tls_client: Arc<ClientConfig>,
    peer: std::net::SocketAddr,
  ) -> Self {
    Self {
      config,
      ca,
      chain,
      connector: TlsConnector::from(tls_client),
      ctx: InterceptContext::new(peer),
      origin: None,
    }
  }

  /// Drive the connection until it closes.
  ///
  /// Recoverable failures are reported through `on_error` and end at most
  /// this one connection; the accept loop never sees them.
  pub(crate) async fn serve(mut self, stream: TcpStream) {
    let dur = self.config.idle_timeout;
    // every leg carries a per-read watchdog instead of per-step deadlines,
    // so slow-but-moving transfers are never cut off
    let mut reader = BufReader::new(Watched::new(stream, dur));
    loop {
      let head = match read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => break,
        Err(error) => {
          let error = normalize_timeout(error, dur);
          self.chain.error(&mut self.ctx, Phase::Request, &error).await;
          break;
        }
      };
      if head.method == Method::CONNECT {
        self.handle_connect(reader, head).await;
        return;
      }
      match self.process_request(&mut reader, head, None).await {
        Ok(true) => continue,
        Ok(false) => break,
        Err(error) => {
          let error = normalize_timeout(error, dur);
          self.chain.error(&mut self.ctx, Phase::Request, &error).await;
          break;
        }
      }
    }
    let _ = reader.get_mut().shutdown().await;
  }

  /// Classify and execute one CONNECT tunnel. Consumes the connection:
  /// after a CONNECT there is no way back to the plain request loop.
  async fn handle_connect(mut self, mut reader: BufReader<Watched<TcpStream>>, head: RequestHead) {
    let decision = self.chain.connect(&mut self.ctx, &head.target).await;
    let (host, port) = split_authority(&decision.host);
    self.ctx.action = Some(decision.action);
    self.ctx.host = Some(decision.host.clone());
    tracing::debug!(peer = %self.ctx.peer, host = %decision.host, action = ?decision.action, "connect");

    match decision.action {
      ConnectAction::Reject => {
        let resp = simple_response(StatusCode::FORBIDDEN, "tunnel refused");
        let _ = reader.get_mut().write_all(&resp.to_raw()).await;
        let _ = reader.get_mut().shutdown().await;
      }
      ConnectAction::Forward => self.forward_tunnel(reader, &host, port).await,
      ConnectAction::Mitm => self.mitm_tunnel(reader, host, port).await,
    }
  }

  /// Blind relay: bytes flow both ways without parsing.
  async fn forward_tunnel(
    mut self,
    mut reader: BufReader<Watched<TcpStream>>,
    host: &str,
    port: u16,
  ) {
    let dur = self.config.idle_timeout;
    let mut origin = match self.dial(host, port).await {
      Ok(stream) => Watched::new(stream, dur),
      Err(error) => {
        self.chain.error(&mut self.ctx, Phase::OriginDial, &error).await;
        let resp = simple_response(StatusCode::BAD_GATEWAY, "origin unreachable");
        let _ = reader.get_mut().write_all(&resp.to_raw()).await;
        return;
      }
    };
    if let Err(error) = reader.get_mut().write_all(CONNECTION_ESTABLISHED).await {
      self.chain.error(&mut self.ctx, Phase::Tunnel, &error.into()).await;
      return;
    }
    // Bytes the client pipelined behind the CONNECT are already buffered;
    // they belong to the origin.
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let mut client = reader.into_inner();
    if !leftover.is_empty() {
      if let Err(error) = origin.write_all(&leftover).await {
        self.chain.error(&mut self.ctx, Phase::Tunnel, &error.into()).await;
        return;
      }
    }
    if let Err(error) = tokio::io::copy_bidirectional(&mut client, &mut origin).await {
      let error = normalize_timeout(error.into(), dur);
      self.chain.error(&mut self.ctx, Phase::Tunnel, &error).await;
    }
  }

  /// Terminate TLS with a forged leaf and run the request loop on the
  /// decrypted stream.
  async fn mitm_tunnel(
    mut self,
    mut reader: BufReader<Watched<TcpStream>>,
    host: String,
    port: u16,
  ) {
    self.ctx.https = true;
    let cert_host = host.trim_matches(|c| c == '[' || c == ']').to_string();

    let leaf = match self.ca.leaf_for(&cert_host).await {
      Ok(leaf) => leaf,
      Err(error) => {
        self.chain.error(&mut self.ctx, Phase::ClientHandshake, &error).await;
        let resp = simple_response(StatusCode::BAD_GATEWAY, "certificate synthesis failed");
        let _ = reader.get_mut().write_all(&resp.to_raw()).await;
        return;
      }
    };
    let acceptor = match tls_acceptor(leaf.chain(), leaf.key()) {
      Ok(acceptor) => acceptor,
      Err(error) => {
        self.chain.error(&mut self.ctx, Phase::ClientHandshake, &error).await;
        return;
      }
    };

    if let Err(error) = reader.get_mut().write_all(CONNECTION_ESTABLISHED).await {
      self.chain.error(&mut self.ctx, Phase::ClientHandshake, &error.into()).await;
      return;
    }
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let rewind = Rewind::new(leftover, reader.into_inner());

    let tls_stream = match acceptor.accept(rewind).await {
      Ok(stream) => stream,
      Err(e) => {
        let error = Error::handshake(format!("client refused forged certificate: {}", e));
        self.chain.error(&mut self.ctx, Phase::ClientHandshake, &error).await;
        return;
      }
    };

    let dur = self.config.idle_timeout;
    let tunnel = Tunnel { host, port };
    let mut reader = BufReader::new(tls_stream);
    loop {
      let head = match read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => break,
        Err(error) => {
          let error = normalize_timeout(error, dur);
          self.chain.error(&mut self.ctx, Phase::Request, &error).await;
          break;
        }
      };
      match self.process_request(&mut reader, head, Some(&tunnel)).await {
        Ok(true) => continue,
        Ok(false) => break,
        Err(error) => {
          let error = normalize_timeout(error, dur);
          self.chain.error(&mut self.ctx, Phase::Request, &error).await;
          break;
        }
      }
    }
    // send close_notify so well-behaved clients see a clean end of stream
    let _ = reader.get_mut().shutdown().await;
  }

  /// Handle one non-CONNECT request end to end. Returns whether the client
  /// connection should be kept open for another request.
  async fn process_request<S>(
    &mut self,
    reader: &mut BufReader<S>,
    head: RequestHead,
    tunnel: Option<&Tunnel>,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    self.ctx.request_ordinal += 1;
    let max = self.config.max_body_capture;
    let framing = head.framing();

    let uri = match resolve_uri(&head, tunnel) {
      Target::Origin(uri) => uri,
      Target::Local => {
        // origin-form request addressed to the proxy itself
        return self.serve_local(reader, head).await;
      }
    };

    // Capture the body up front so hooks see the complete request.
    let capture = relay::capture(reader, framing, max).await?;
    let overflow = match capture {
      Capture::Complete(body) => {
        let mut request = head.into_request(uri, body.into_body());
        return self.exchange(reader, &mut request, tunnel).await;
      }
      Capture::Overflow(overflow) => overflow,
    };

    // Too large to inspect: report, then pump the request through
    // untouched and relay the response as usual.
    let error = Error::BodyTooLarge {
      limit: overflow.limit(),
    };
    self.chain.error(&mut self.ctx, Phase::Request, &error).await;
    tracing::warn!(peer = %self.ctx.peer, limit = overflow.limit(), "request body exceeds capture limit, passing through uninspected");

    let keep_client = !crate::request::wants_close(head.version, &head.headers);
    let (host, port, tls) = origin_target(&uri, tunnel)?;
    if self.ensure_origin(reader, &host, port, tls).await? {
      // half-consumed request body, the connection is desynchronized
      return Ok(false);
    }
    let link = self.origin.as_mut().ok_or_else(origin_gone)?;
    link.stream.get_mut().write_all(&raw_request_head(&head)).await?;
    overflow.relay_to(reader, link.stream.get_mut()).await?;

    self.relay_response(reader, &head.method, keep_client).await
  }

  /// Run hooks, dial (or reuse) the origin, and relay one exchange.
  async fn exchange<S>(
    &mut self,
    reader: &mut BufReader<S>,
    request: &mut Request,
    tunnel: Option<&Tunnel>,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let keep_client = !request.wants_close();

    if tunnel.is_none() {
      if let Some(response) = self.chain.accept(&mut self.ctx, request).await {
        write_client_response(reader, response).await?;
        return Ok(keep_client);
      }
    }

    if let Some(response) = self.chain.request(&mut self.ctx, request).await {
      // Short-circuit: the callback answered, the origin is never dialed.
      write_client_response(reader, response).await?;
      return Ok(keep_client);
    }

    let (host, port) = request.host_port()?;
    let tls = tunnel.is_some() || request.uri().scheme_str() == Some("https");
    if self.ensure_origin(reader, &host, port, tls).await? {
      return Ok(keep_client);
    }

    let max = self.config.max_body_capture;
    let link = self.origin.as_mut().ok_or_else(origin_gone)?;
    link.stream.get_mut().write_all(&request.to_raw()).await?;
    link.stream.get_mut().flush().await?;

    let head = read_response_head(&mut link.stream).await?;
    let framing = head.framing(request.method());
    let capture = relay::capture(&mut link.stream, framing, max).await?;

    match capture {
      Capture::Complete(body) => {
        let mut response = head.into_response(framing, body.into_body());
        self.chain.response(&mut self.ctx, request, &mut response).await;
        let origin_close = response.wants_close();
        write_client_response(reader, response).await?;
        if origin_close {
          self.origin = None;
        }
        Ok(keep_client)
      }
      Capture::Overflow(overflow) => {
        let error = Error::BodyTooLarge {
          limit: overflow.limit(),
        };
        self.chain.error(&mut self.ctx, Phase::Response, &error).await;
        tracing::warn!(peer = %self.ctx.peer, limit = overflow.limit(), "response body exceeds capture limit, passing through uninspected");
        reader.get_mut().write_all(&raw_response_head(&head)).await?;
        let link = self.origin.as_mut().ok_or_else(origin_gone)?;
        overflow.relay_to(&mut link.stream, reader.get_mut()).await?;
        if framing == Framing::Close || wants_close_head(&head) {
          self.origin = None;
        }
        Ok(keep_client && framing != Framing::Close)
      }
    }
  }

  /// Relay one origin response after an uninspected request body.
  async fn relay_response<S>(
    &mut self,
    reader: &mut BufReader<S>,
    method: &Method,
    keep_client: bool,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let link = self.origin.as_mut().ok_or_else(origin_gone)?;
    let head = read_response_head(&mut link.stream).await?;
    let framing = head.framing(method);
    reader.get_mut().write_all(&raw_response_head(&head)).await?;
    relay::passthrough(&mut link.stream, reader.get_mut(), framing).await?;
    if framing == Framing::Close || wants_close_head(&head) {
      self.origin = None;
    }
    Ok(keep_client && framing != Framing::Close)
  }

  /// Make sure `self.origin` points at the requested origin, dialing if
  /// needed. Returns `true` when dialing failed and a 502 was written.
  async fn ensure_origin<S>(
    &mut self,
    reader: &mut BufReader<S>,
    host: &str,
    port: u16,
    tls: bool,
  ) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let reusable = matches!(
      &self.origin,
      Some(link) if link.host == host && link.port == port && link.tls == tls
    );
    if reusable {
      return Ok(false);
    }
    self.origin = None;

    let stream = match self.dial(host, port).await {
      Ok(stream) => Watched::new(stream, self.config.idle_timeout),
      Err(error) => {
        self.chain.error(&mut self.ctx, Phase::OriginDial, &error).await;
        let resp = simple_response(StatusCode::BAD_GATEWAY, "origin unreachable");
        write_client_response(reader, resp).await?;
        return Ok(true);
      }
    };
    let stream = if tls {
      let name = ServerName::try_from(host.trim_matches(|c| c == '[' || c == ']').to_string())
        .map_err(|_| Error::handshake(format!("invalid server name {host:?}")))?;
      match self.connector.connect(name, stream).await {
        Ok(tls_stream) => MaybeTlsStream::Tls(Box::new(tls_stream)),
        Err(e) => {
          let error = Error::handshake(format!("origin {host}: {e}"));
          self.chain.error(&mut self.ctx, Phase::OriginHandshake, &error).await;
          let resp = simple_response(StatusCode::BAD_GATEWAY, "origin TLS handshake failed");
          write_client_response(reader, resp).await?;
          return Ok(true);
        }
      }
    } else {
      MaybeTlsStream::Tcp(stream)
    };

    self.origin = Some(OriginLink {
      host: host.to_string(),
      port,
      tls,
      stream: BufReader::new(stream),
    });
    Ok(false)
  }

  async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
      Ok(Ok(stream)) => Ok(stream),
      Ok(Err(source)) => Err(Error::Dial { host: addr, source }),
      Err(_) => Err(Error::Dial {
        host: addr,
        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
      }),
    }
  }

  /// Origin-form requests hit the proxy itself instead of being forwarded.
  async fn serve_local<S>(&mut self, reader: &mut BufReader<S>, head: RequestHead) -> Result<bool>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let framing = head.framing();
    let body = match relay::capture(reader, framing, self.config.max_body_capture).await? {
      Capture::Complete(body) => body.into_body(),
      Capture::Overflow(_) => {
        return Err(Error::BodyTooLarge {
          limit: self.config.max_body_capture,
        });
      }
    };
    let uri = head
      .target
      .parse::<Uri>()
      .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))?;
    let request = head.into_request(uri, body);
    let keep = !request.wants_close();

    if let Some(response) = self.chain.accept(&mut self.ctx, &request).await {
      write_client_response(reader, response).await?;
      return Ok(keep);
    }

    let response = if request.method() == Method::GET && request.uri().path() == "/info" {
      simple_response(StatusCode::OK, INFO_BODY)
    } else {
      simple_response(StatusCode::NOT_FOUND, "not a proxy request")
    };
    write_client_response(reader, response).await?;
    Ok(keep)
  }
}

/// Tunnel target fixed at CONNECT time.
struct Tunnel {
  host: String,
  port: u16,
}

enum Target {
  Origin(Uri),
  Local,
}

/// Attribute a stalled-leg read error to the configured idle limit.
fn normalize_timeout(error: Error, limit: Duration) -> Error {
  match &error {
    Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => Error::IdleTimeout(limit),
    _ => error,
  }
}

async fn write_client_response<S>(reader: &mut BufReader<S>, mut response: Response) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  // callbacks build responses without wire framing; give them one
  if response.framing() == Framing::None && response.body().is_some() {
    let len = response.body().map(|b| b.len() as u64).unwrap_or(0);
    response.set_framing(Framing::ContentLength(len));
  }
  reader.get_mut().write_all(&response.to_raw()).await?;
  reader.get_mut().flush().await?;
  Ok(())
}

/// Resolve the request target to an absolute URI, or detect a request
/// addressed to the proxy itself.
fn resolve_uri(head: &RequestHead, tunnel: Option<&Tunnel>) -> Target {
  match uri_of(head, tunnel) {
    Ok(uri) if uri.authority().is_some() => Target::Origin(uri),
    _ => Target::Local,
  }
}

fn uri_of(head: &RequestHead, tunnel: Option<&Tunnel>) -> Result<Uri> {
  let text = match tunnel {
    Some(tunnel) if head.target.starts_with('/') => {
      if tunnel.port == 443 {
        format!("https://{}{}", tunnel.host, head.target)
      } else {
        format!("https://{}:{}{}", tunnel.host, tunnel.port, head.target)
      }
    }
    _ => head.target.clone(),
  };
  text
    .parse::<Uri>()
    .map_err(|_| Error::invalid_request(format!("invalid request target {:?}", head.target)))
}

fn origin_target(uri: &Uri, tunnel: Option<&Tunnel>) -> Result<(String, u16, bool)> {
  let authority = uri
    .authority()
    .ok_or_else(|| Error::invalid_request("request URI has no authority"))?;
  let tls = tunnel.is_some() || uri.scheme_str() == Some("https");
  let default_port = if tls { 443 } else { 80 };
  Ok((
    authority.host().to_string(),
    authority.port_u16().unwrap_or(default_port),
    tls,
  ))
}

/// Split a CONNECT authority into host and port, defaulting to 443.
fn split_authority(authority: &str) -> (String, u16) {
  if let Some((host, port)) = authority.rsplit_once(':') {
    if let Ok(port) = port.parse::<u16>() {
      return (host.to_string(), port);
    }
  }
  (authority.to_string(), 443)
}

/// Serialize a request head verbatim for uninspected passthrough. The
/// headers are not reconciled: the body that follows is the client's exact
/// wire bytes, so the framing they announce is already correct.
fn raw_request_head(head: &RequestHead) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend(head.method.as_str().as_bytes());
  out.extend(SPACE);
  let target = head
    .target
    .parse::<Uri>()
    .ok()
    .filter(|u| u.authority().is_some())
    .map(|u| {
      let mut t = if u.path().is_empty() { "/" } else { u.path() }.to_string();
      if let Some(q) = u.query() {
        t.push('?');
        t.push_str(q);
      }
      t
    })
    .unwrap_or_else(|| head.target.clone());
  out.extend(target.as_bytes());
  out.extend(SPACE);
  out.extend(format!("{:?}", head.version).as_bytes());
  out.extend(CR_LF);
  for (k, v) in head.headers.iter() {
    out.extend(k.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(v.as_bytes());
    out.extend(CR_LF);
  }
  out.extend(CR_LF);
  out
}

fn raw_response_head(head: &ResponseHead) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend(format!("{:?}", head.version).as_bytes());
  out.extend(SPACE);
  out.extend(format!("{}", head.status).as_bytes());
  out.extend(CR_LF);
  for (k, v) in head.headers.iter() {
    out.extend(k.as_str().as_bytes());
    out.extend(COLON_SPACE);
    out.extend(v.as_bytes());
    out.extend(CR_LF);
  }
  out.extend(CR_LF);
  out
}

fn wants_close_head(head: &ResponseHead) -> bool {
  crate::request::wants_close(head.version, &head.headers)
}

fn simple_response(status: StatusCode, body: &'static str) -> Response {
  let mut response = Response::from(
    Response::builder()
      .status(status)
      .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
      .body(Bytes::from_static(body.as_bytes()))
      .unwrap_or_default(),
  );
  response.set_framing(Framing::ContentLength(body.len() as u64));
  response
}

fn tls_acceptor(
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
  let mut server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .map_err(|e| Error::handshake(format!("bad leaf credential: {e}")))?;
  server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn origin_gone() -> Error {
  Error::Io(io::Error::new(
    io::ErrorKind::NotConnected,
    "origin link dropped mid-exchange",
  ))
}
