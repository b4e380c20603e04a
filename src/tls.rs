//! TLS interception
//!
//! Terminates client TLS with a CA-minted leaf certificate for the
//! requested host and opens a separate, re-encrypted TLS session to the
//! real upstream. The two legs never share secrets.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateStore;
use crate::connector::Connector;
use crate::errors::{Error, Leg, Result};
use crate::socket::Socket;

/// Performs the two TLS handshakes of an intercepted HTTPS flow.
pub struct TlsInterceptor {
  certs: Arc<CertificateStore>,
  connector: Arc<Connector>,
}

impl TlsInterceptor {
  /// Create an interceptor issuing from `certs` and dialing with `connector`.
  pub fn new(certs: Arc<CertificateStore>, connector: Arc<Connector>) -> Self {
    Self { certs, connector }
  }

  /// Terminate TLS on the client leg, presenting a leaf minted for `host`.
  pub async fn accept_client<IO>(
    &self,
    stream: IO,
    host: &str,
  ) -> Result<tokio_rustls::server::TlsStream<IO>>
  where
    IO: AsyncRead + AsyncWrite + Unpin,
  {
    let (chain, key) = self.certs.leaf_for(host).await?;
    let provider = tokio_rustls::rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()));
    let config = ServerConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_handshake(Leg::Client, e.to_string()))?
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::tls_handshake(Leg::Client, e.to_string()))?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::tls_handshake(Leg::Client, e.to_string()))
  }

  /// Dial `host:port` and complete a TLS handshake on the upstream leg.
  pub async fn connect_upstream(&self, host: &str, port: u16) -> Result<Socket> {
    let socket = self.connector.connect(host, port).await?;
    self.connector.upgrade_to_tls(socket, host).await
  }

  /// Dial `host:port` without TLS, for plain intercepted flows.
  pub async fn connect_plain(&self, host: &str, port: u16) -> Result<Socket> {
    self.connector.connect(host, port).await
  }

  /// The certificate store backing the client leg.
  pub fn certs(&self) -> &Arc<CertificateStore> {
    &self.certs
  }
}

/// Accepts any upstream certificate, for intercepting flows to servers with
/// invalid or self-signed certificates.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
