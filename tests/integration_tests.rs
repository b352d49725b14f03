use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use tapwire::{
  CertificateAuthority, ConnectDecision, Error, ErrorKind, Handlers, InterceptContext,
  NoopHandlers, Phase, ProxyConfig, ProxyListener, Request, Response,
};

async fn start_proxy(
  mut config: ProxyConfig,
  handlers: Arc<dyn Handlers>,
) -> (SocketAddr, Vec<u8>) {
  config.listen = "127.0.0.1:0".parse().unwrap();
  let proxy = ProxyListener::new(config, handlers).await.unwrap();
  let root_der = proxy.ca().root_cert_der().as_ref().to_vec();
  let bound = proxy.bind().await.unwrap();
  let addr = bound.local_addr();
  tokio::spawn(bound.serve());
  (addr, root_der)
}

async fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(request).await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  String::from_utf8_lossy(&out).into_owned()
}

/// Records every error kind reported through `on_error`.
#[derive(Default)]
struct Recorder {
  kinds: Mutex<Vec<ErrorKind>>,
}

#[async_trait::async_trait]
impl Handlers for Recorder {
  async fn on_error(&self, _ctx: &InterceptContext, _phase: Phase, kind: ErrorKind, _error: &Error) {
    self.kinds.lock().unwrap().push(kind);
  }
}

#[tokio::test]
async fn distinct_hosts_get_distinct_leaves_with_matching_san() {
  let ca = CertificateAuthority::ephemeral().unwrap();
  let a = ca.leaf_for("alpha.example").await.unwrap();
  let b = ca.leaf_for("beta.example").await.unwrap();
  assert_ne!(a.leaf_der().as_ref(), b.leaf_der().as_ref());

  let (_, cert) = x509_parser::parse_x509_certificate(a.leaf_der().as_ref()).unwrap();
  let san = cert.subject_alternative_name().unwrap().unwrap();
  let has_dns = san.value.general_names.iter().any(|name| {
    matches!(name, x509_parser::extensions::GeneralName::DNSName(dns) if *dns == "alpha.example")
  });
  assert!(has_dns, "leaf is missing its dNSName SAN");
}

#[tokio::test]
async fn repeated_leaf_requests_return_identical_bytes() {
  let ca = CertificateAuthority::ephemeral().unwrap();
  let first = ca.leaf_for("cache.example").await.unwrap();
  let second = ca.leaf_for("cache.example").await.unwrap();
  assert_eq!(first.leaf_der().as_ref(), second.leaf_der().as_ref());
}

#[tokio::test]
async fn concurrent_leaf_requests_coalesce_to_one_signing() {
  let ca = Arc::new(CertificateAuthority::ephemeral().unwrap());
  let mut tasks = Vec::new();
  for _ in 0..8 {
    let ca = ca.clone();
    tasks.push(tokio::spawn(async move {
      ca.leaf_for("storm.example").await.unwrap().leaf_der().as_ref().to_vec()
    }));
  }
  let mut certs = Vec::new();
  for task in tasks {
    certs.push(task.await.unwrap());
  }
  assert!(certs.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn info_endpoint_identifies_the_proxy() {
  let (addr, _) = start_proxy(ProxyConfig::default(), Arc::new(NoopHandlers)).await;
  let reply = roundtrip(
    addr,
    b"GET /info HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("This is tapwire."));
}

#[tokio::test]
async fn missing_ca_files_fall_back_to_an_ephemeral_root() {
  let config = ProxyConfig {
    ca_cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
    ca_key_path: Some(PathBuf::from("/nonexistent/key.pem")),
    ..ProxyConfig::default()
  };
  let (addr, root_der) = start_proxy(config, Arc::new(NoopHandlers)).await;
  assert!(!root_der.is_empty());
  let reply = roundtrip(
    addr,
    b"GET /info HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn plain_requests_are_proxied_to_the_origin() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut buf = [0u8; 2048];
    let n = stream.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]).into_owned();
    assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nfrom me")
      .await
      .unwrap();
  });

  let (addr, _) = start_proxy(ProxyConfig::default(), Arc::new(NoopHandlers)).await;
  let request = format!(
    "GET http://{origin_addr}/hello HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
  );
  let reply = roundtrip(addr, request.as_bytes()).await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("from me"));
}

#[tokio::test]
async fn unreachable_origin_yields_502_and_dial_failure() {
  let recorder = Arc::new(Recorder::default());
  let (addr, _) = start_proxy(ProxyConfig::default(), recorder.clone()).await;
  let reply = roundtrip(
    addr,
    b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
  assert!(recorder
    .kinds
    .lock()
    .unwrap()
    .contains(&ErrorKind::DialFailure));
}

struct ShortCircuit;

#[async_trait::async_trait]
impl Handlers for ShortCircuit {
  async fn on_request(&self, _ctx: &mut InterceptContext, _req: &mut Request) -> Option<Response> {
    Some(Response::from(
      Response::builder()
        .status(200)
        .body(bytes::Bytes::from_static(b"intercepted"))
        .unwrap(),
    ))
  }
}

#[tokio::test]
async fn on_request_short_circuit_skips_the_origin_dial() {
  let (addr, _) = start_proxy(ProxyConfig::default(), Arc::new(ShortCircuit)).await;
  // port 1 would fail to dial; a reply proves no dial was attempted
  let reply = roundtrip(
    addr,
    b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n",
  )
  .await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("intercepted"));
}

struct RejectAll;

#[async_trait::async_trait]
impl Handlers for RejectAll {
  async fn on_connect(&self, _ctx: &mut InterceptContext, host: &str) -> ConnectDecision {
    ConnectDecision::reject(host)
  }
}

#[tokio::test]
async fn rejected_connect_gets_403() {
  let (addr, _) = start_proxy(ProxyConfig::default(), Arc::new(RejectAll)).await;
  let reply = roundtrip(addr, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await;
  assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[tokio::test]
async fn mitm_handshake_presents_a_trusted_forged_certificate() {
  let (addr, root_der) = start_proxy(ProxyConfig::default(), Arc::new(ShortCircuit)).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let mut buf = [0u8; 256];
  let n = stream.read(&mut buf).await.unwrap();
  let established = String::from_utf8_lossy(&buf[..n]);
  assert!(established.starts_with("HTTP/1.1 200"));

  let mut roots = RootCertStore::empty();
  roots.add(root_der.into()).unwrap();
  let client_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let name = ServerName::try_from("example.com").unwrap();
  let mut tls = connector.connect(name, stream).await.unwrap();

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let mut reply = Vec::new();
  tls.read_to_end(&mut reply).await.unwrap();
  let reply = String::from_utf8_lossy(&reply);
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("intercepted"));
}

#[tokio::test]
async fn oversized_request_body_passes_through_intact() {
  let payload = vec![b'a'; 100];
  let expected = payload.clone();

  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    // read until the full head plus 100-byte body arrived
    loop {
      let n = stream.read(&mut buf).await.unwrap();
      seen.extend_from_slice(&buf[..n]);
      if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
        if seen.len() >= pos + 4 + 100 {
          assert_eq!(&seen[pos + 4..pos + 4 + 100], expected.as_slice());
          break;
        }
      }
    }
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
  });

  let recorder = Arc::new(Recorder::default());
  let config = ProxyConfig {
    max_body_capture: 8,
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy(config, recorder.clone()).await;

  let mut request = format!(
    "POST http://{origin_addr}/upload HTTP/1.1\r\nHost: {origin_addr}\r\nContent-Length: 100\r\nConnection: close\r\n\r\n"
  )
  .into_bytes();
  request.extend_from_slice(&payload);
  let reply = roundtrip(addr, &request).await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("ok"));
  assert!(recorder
    .kinds
    .lock()
    .unwrap()
    .contains(&ErrorKind::BodyTooLarge));
}

#[tokio::test]
async fn slow_but_active_origin_survives_the_idle_window() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let mut buf = [0u8; 2048];
    let _ = stream.read(&mut buf).await.unwrap();
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
      .await
      .unwrap();
    // each byte arrives within the window, the whole body does not
    for byte in b"drip!" {
      tokio::time::sleep(Duration::from_millis(150)).await;
      stream.write_all(&[*byte]).await.unwrap();
    }
  });

  let config = ProxyConfig {
    idle_timeout: Duration::from_millis(300),
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy(config, Arc::new(NoopHandlers)).await;
  let request = format!(
    "GET http://{origin_addr}/slow HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
  );
  let reply = roundtrip(addr, request.as_bytes()).await;
  assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(reply.ends_with("drip!"));
}

/// Forwards every CONNECT and records the error kinds it sees.
#[derive(Default)]
struct ForwardRecorder {
  kinds: Mutex<Vec<ErrorKind>>,
}

#[async_trait::async_trait]
impl Handlers for ForwardRecorder {
  async fn on_connect(&self, _ctx: &mut InterceptContext, host: &str) -> ConnectDecision {
    ConnectDecision::forward(host)
  }

  async fn on_error(&self, _ctx: &InterceptContext, _phase: Phase, kind: ErrorKind, _error: &Error) {
    self.kinds.lock().unwrap().push(kind);
  }
}

#[tokio::test]
async fn stalled_forward_tunnel_is_torn_down() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  tokio::spawn(async move {
    let (stream, _) = origin.accept().await.unwrap();
    // keep the socket open without ever moving a byte
    tokio::time::sleep(Duration::from_secs(30)).await;
    drop(stream);
  });

  let recorder = Arc::new(ForwardRecorder::default());
  let config = ProxyConfig {
    idle_timeout: Duration::from_millis(200),
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy(config, recorder.clone()).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  let connect = format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n");
  stream.write_all(connect.as_bytes()).await.unwrap();
  let mut buf = [0u8; 256];
  let n = stream.read(&mut buf).await.unwrap();
  assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

  // neither side sends anything; the proxy must hang up on its own
  let outcome = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
    .await
    .expect("proxy did not time out the stalled tunnel");
  match outcome {
    Ok(0) | Err(_) => {}
    Ok(n) => panic!("unexpected {n} bytes from a silent tunnel"),
  }
  assert!(recorder
    .kinds
    .lock()
    .unwrap()
    .contains(&ErrorKind::Transport));
}

#[tokio::test]
async fn idle_client_is_disconnected() {
  let config = ProxyConfig {
    idle_timeout: Duration::from_millis(200),
    ..ProxyConfig::default()
  };
  let (addr, _) = start_proxy(config, Arc::new(NoopHandlers)).await;
  let mut stream = TcpStream::connect(addr).await.unwrap();
  // never send anything; the proxy should hang up on its own
  let mut buf = [0u8; 16];
  let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
    .await
    .expect("proxy did not enforce its idle timeout")
    .unwrap();
  assert_eq!(n, 0);
}
