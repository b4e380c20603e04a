//! Certificate authority for TLS interception
//!
//! Owns the root CA keypair (generated on first run and persisted as PEM)
//! and mints short-lived leaf certificates for intercepted hostnames on
//! demand, fronted by an in-memory cache.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::{Error, Result};

/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (half the leaf validity)
const CACHE_TTL: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Backdate not_before to tolerate client clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// The root certificate authority trusted by intercepted clients.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA persisted at `storage_path`, or generate and persist a new
  /// one when none exists yet.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let ca_cert_path = storage_path.join("ca_cert.pem");
    let ca_key_path = storage_path.join("ca_key.pem");

    let (issuer, ca_cert_der) = if ca_cert_path.exists() && ca_key_path.exists() {
      Self::load_root(&ca_cert_path, &ca_key_path).await?
    } else {
      Self::generate_root(&ca_cert_path, &ca_key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  async fn load_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair =
      KeyPair::from_pem(&key_pem).map_err(|e| Error::ca(format!("failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("failed to load CA certificate: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca("no certificate found in CA PEM"))?
      .map_err(|e| Error::ca(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  async fn generate_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interpose Proxy CA");
    dn.push(DnType::OrganizationName, "Interpose");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("failed to generate CA key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca(format!("failed to self-sign CA certificate: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca(format!("failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Mint a leaf certificate for `host`, signed by this CA.
  ///
  /// Returns the chain `[leaf, root]` plus the leaf private key. IP literals
  /// get both an iPAddress SAN and a dNSName SAN with the textual form, since
  /// clients differ on which they check for IP targets.
  pub fn issue_leaf(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::ca(format!("invalid hostname for certificate: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca(format!("failed to generate leaf key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::ca(format!("failed to sign leaf certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::ca("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// The persisted root certificate in PEM form, for client trust stores.
  pub fn root_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.root_cert_path())
      .map_err(|e| Error::ca(format!("failed to read CA certificate: {}", e)))
  }

  /// Path of the persisted root certificate.
  pub fn root_cert_path(&self) -> PathBuf {
    self.storage_path.join("ca_cert.pem")
  }
}

/// Caching front for leaf certificate issuance.
pub struct CertificateStore {
  ca: CertificateAuthority,
  cache: Cache<String, Arc<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>>,
}

impl CertificateStore {
  /// Create a store backed by the CA persisted at `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self { ca, cache })
  }

  /// Get a cached leaf for `host`, minting one when absent.
  pub async fn leaf_for(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let Some(cached) = self.cache.get(host).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }

    let (chain, key) = self.ca.issue_leaf(host)?;
    self
      .cache
      .insert(host.to_string(), Arc::new((chain.clone(), key.clone_key())))
      .await;
    Ok((chain, key))
  }

  /// The root certificate in PEM form, for client trust stores.
  pub fn root_cert_pem(&self) -> Result<String> {
    self.ca.root_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn root_cert_path(&self) -> PathBuf {
    self.ca.root_cert_path()
  }
}
