//! Upstream connection establishment
//!
//! Resolves and dials origin servers, optionally upgrading the connection to
//! TLS for intercepted HTTPS flows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Leg, Result};
use crate::socket::{Socket, StreamWrapper};
use crate::tls::NoVerifier;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  verify_upstream: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      write_timeout: Some(Duration::from_secs(30)),
      nodelay: true,
      keepalive: false,
      verify_upstream: true,
    }
  }
}

impl ConnectorBuilder {
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }

  /// Enables a write timeout, applied to each write operation.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }

  /// Set that all sockets have `SO_NODELAY` set to the supplied value.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }

  /// Sets value for the `SO_KEEPALIVE` option on upstream sockets.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }

  /// Controls validation of upstream server certificates.
  ///
  /// Defaults to `true`. Disabling lets flows to servers with invalid
  /// certificates be intercepted.
  pub fn verify_upstream(mut self, value: bool) -> ConnectorBuilder {
    self.verify_upstream = value;
    self
  }

  /// Combine the configuration of this builder into a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let provider = tokio_rustls::rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()));
    let config_builder = ClientConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_handshake(Leg::Upstream, e.to_string()))?;
    let config = if self.verify_upstream {
      let mut roots = RootCertStore::empty();
      roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
      config_builder
        .with_root_certificates(roots)
        .with_no_client_auth()
    } else {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
    };
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      write_timeout: self.write_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      tls: TlsConnector::from(Arc::new(config)),
    })
  }
}

/// Connector
pub struct Connector {
  connect_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  tls: TlsConnector,
}

impl Connector {
  /// Resolve `host:port` and open a plain TCP connection to it.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs
      .next()
      .ok_or_else(|| new_io_error(std::io::ErrorKind::NotFound, "hostname did not resolve"))?;
    self.connect_with_addr(addr).await
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(StreamWrapper::Tcp(stream), self.write_timeout))
  }

  /// Upgrade a plain upstream connection to TLS with SNI `domain`.
  pub async fn upgrade_to_tls(&self, socket: Socket, domain: &str) -> Result<Socket> {
    let server_name = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_handshake(Leg::Upstream, e.to_string()))?;
    match socket.inner {
      StreamWrapper::Tcp(stream) => {
        let handshake = self.tls.connect(server_name, stream);
        let tls_stream = match self.connect_timeout {
          None => handshake.await,
          Some(timeout) => tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| Error::tls_handshake(Leg::Upstream, "handshake timed out"))?,
        }
        .map_err(|e| Error::tls_handshake(Leg::Upstream, e.to_string()))?;
        Ok(Socket::new(
          StreamWrapper::Tls(Box::new(tls_stream)),
          socket.write_timeout,
        ))
      }
      already_tls @ StreamWrapper::Tls(_) => Ok(Socket::new(already_tls, socket.write_timeout)),
    }
  }
}

impl Default for Connector {
  fn default() -> Self {
    // the default builder cannot produce an invalid TLS config
    match ConnectorBuilder::default().build() {
      Ok(c) => c,
      Err(_) => unreachable!("default connector configuration is valid"),
    }
  }
}
