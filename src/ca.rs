//! Certificate authority for TLS interception.
//!
//! Holds one root key/certificate pair for the process lifetime and
//! synthesizes leaf certificates for intercepted hosts on demand. Leaves are
//! memoized per normalized host: the second handshake for a host reuses the
//! exact bytes of the first, and concurrent first handshakes for the same
//! host coalesce into a single signing operation.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf certificate validity in seconds (1 year).
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before to tolerate client clock skew (60 seconds).
const NOT_BEFORE_OFFSET: i64 = 60;
/// Distinct hosts kept in the leaf cache.
const LEAF_CACHE_CAPACITY: u64 = 4096;

/// A synthesized per-host certificate, shared between handshakes.
pub struct LeafCert {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCert {
  /// Certificate chain to present: `[leaf, root]`.
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }

  /// Leaf DER bytes (without the root), for inspection.
  pub fn leaf_der(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }

  /// A fresh handle to the private key.
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
}

/// Certificate authority issuing forged leaves for intercepted hosts.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_der: CertificateDer<'static>,
  root_pem: String,
  leaves: Cache<String, Arc<LeafCert>>,
}

impl CertificateAuthority {
  /// Load a root credential from PEM files.
  ///
  /// Any read or parse failure is a recoverable `CertLoad` error; callers
  /// are expected to fall back to [`CertificateAuthority::ephemeral`].
  pub async fn load_root(cert_path: &Path, key_path: &Path) -> Result<Self> {
    let cert_pem = tokio::fs::read_to_string(cert_path)
      .await
      .map_err(|e| Error::cert_load(format!("read {}: {}", cert_path.display(), e)))?;
    let key_pem = tokio::fs::read_to_string(key_path)
      .await
      .map_err(|e| Error::cert_load(format!("read {}: {}", key_path.display(), e)))?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::cert_load(format!("parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::cert_load(format!("parse CA certificate: {}", e)))?;

    let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::cert_load("no certificate found in PEM"))?
      .map_err(|e| Error::cert_load(format!("decode CA PEM: {}", e)))?;

    Ok(Self::assemble(issuer, root_der, cert_pem))
  }

  /// Generate a self-signed root in memory, never touching disk.
  ///
  /// Used when no CA files were supplied or loading them failed; clients
  /// will see certificate warnings unless they trust the exported root.
  pub fn ephemeral() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "tapwire ephemeral CA");
    dn.push(DnType::OrganizationName, "tapwire");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_sign(format!("generate root key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::cert_sign(format!("self-sign root: {}", e)))?;

    let root_pem = cert.pem();
    let root_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&root_pem, key_pair)
      .map_err(|e| Error::cert_sign(format!("build issuer: {}", e)))?;

    Ok(Self::assemble(issuer, root_der, root_pem))
  }

  fn assemble(
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
    root_pem: String,
  ) -> Self {
    Self {
      issuer,
      root_der,
      root_pem,
      leaves: Cache::builder().max_capacity(LEAF_CACHE_CAPACITY).build(),
    }
  }

  /// Root certificate in PEM form, for installation in a client trust store.
  pub fn root_cert_pem(&self) -> &str {
    &self.root_pem
  }

  /// Root certificate in DER form.
  pub fn root_cert_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }

  /// Get (or synthesize) the leaf certificate for `host`.
  ///
  /// The first caller for a host signs the leaf; concurrent callers for the
  /// same uncached host wait for that signing and receive the identical
  /// `Arc`. Different hosts never contend with each other.
  pub async fn leaf_for(&self, host: &str) -> Result<Arc<LeafCert>> {
    let host = normalize_host(host);
    self
      .leaves
      .try_get_with(host.clone(), async { self.mint(&host).map(Arc::new) })
      .await
      .map_err(|e: Arc<Error>| Error::cert_sign(e.to_string()))
  }

  /// Synthesize a leaf for one host, signed by the root.
  fn mint(&self, host: &str) -> Result<LeafCert> {
    let mut params = CertificateParams::default();

    // Random serial so every mint is unique even across restarts.
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP literals get both an iPAddress and a dNSName SAN; strict clients
    // check one or the other.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::cert_sign(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::cert_sign(format!("generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::cert_sign(format!("sign leaf for {}: {}", host, e)))?;

    let leaf_der = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::cert_sign("serialize leaf key"))?;

    Ok(LeafCert {
      chain: vec![leaf_der, self.root_der.clone()],
      key,
    })
  }
}

/// Hostname normalization used as the cache key: ASCII-lowercased with any
/// trailing dot stripped.
fn normalize_host(host: &str) -> String {
  host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_normalization_folds_case_and_trailing_dot() {
    assert_eq!(normalize_host("Example.COM."), "example.com");
    assert_eq!(normalize_host("127.0.0.1"), "127.0.0.1");
  }

  #[tokio::test]
  async fn equivalent_spellings_share_one_cache_entry() {
    let ca = CertificateAuthority::ephemeral().unwrap();
    let a = ca.leaf_for("Example.com").await.unwrap();
    let b = ca.leaf_for("example.com.").await.unwrap();
    assert_eq!(a.leaf_der().as_ref(), b.leaf_der().as_ref());
  }
}
