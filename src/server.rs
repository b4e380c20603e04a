//! Proxy server
//!
//! Accepts client connections, sniffs CONNECT from the request line and
//! routes each connection into a [`FlowRelay`], with TLS interception on
//! tunneled streams.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::ca::CertificateStore;
use crate::codec;
use crate::config::ProxyConfig;
use crate::connector::ConnectorBuilder;
use crate::errors::{Error, Result};
use crate::hooks::HookRegistry;
use crate::relay::FlowRelay;
use crate::request::split_host_port;
use crate::tls::TlsInterceptor;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_CONNECT_HEADERS: usize = 16 * 1024;

/// The interception proxy.
pub struct Proxy {
  config: ProxyConfig,
  certs: Arc<CertificateStore>,
  hooks: Arc<RwLock<HookRegistry>>,
  interceptor: Arc<TlsInterceptor>,
}

impl Proxy {
  /// Create a proxy from `config`.
  ///
  /// Fails when the CA root cannot be loaded or generated; without a root
  /// the proxy cannot intercept anything.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let certs = Arc::new(CertificateStore::new(&config.ca_storage_path).await?);
    let connector = Arc::new(
      ConnectorBuilder::default()
        .verify_upstream(config.verify_upstream)
        .connect_timeout(config.connect_timeout)
        .write_timeout(config.write_timeout)
        .build()?,
    );
    let interceptor = Arc::new(TlsInterceptor::new(certs.clone(), connector));
    Ok(Self {
      config,
      certs,
      hooks: Arc::new(RwLock::new(HookRegistry::new())),
      interceptor,
    })
  }

  /// The hook registry; register hooks before calling [`Proxy::run`].
  pub fn hooks(&self) -> Arc<RwLock<HookRegistry>> {
    self.hooks.clone()
  }

  /// The certificate store, for exporting the root certificate.
  pub fn certs(&self) -> &Arc<CertificateStore> {
    &self.certs
  }

  /// Bind `addr` and serve until the process is terminated.
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::protocol(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!("listening on {}", addr);
    self.serve(listener).await
  }

  /// Serve connections from an already-bound listener.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let config = self.config.clone();
          let hooks = self.hooks.clone();
          let interceptor = self.interceptor.clone();
          tokio::spawn(async move {
            if let Err(e) =
              Self::handle_connection(stream, peer_addr, config, hooks, interceptor).await
            {
              tracing::debug!(client = %peer_addr, "connection ended with error: {}", e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: ProxyConfig,
    hooks: Arc<RwLock<HookRegistry>>,
    interceptor: Arc<TlsInterceptor>,
  ) -> Result<()> {
    let mut request_line = Vec::new();
    let mut buffer = [0u8; 1];
    loop {
      let n = stream.read(&mut buffer).await?;
      if n == 0 {
        // closed before sending anything
        return Ok(());
      }
      request_line.push(buffer[0]);
      if buffer[0] == b'\n' {
        break;
      }
      if request_line.len() > MAX_REQUEST_LINE {
        return Err(Error::protocol("request line too long"));
      }
    }

    let request_line_str = String::from_utf8_lossy(&request_line).into_owned();
    let parts: Vec<&str> = request_line_str.split_whitespace().collect();
    if parts.len() < 3 {
      return Err(Error::protocol("invalid request line"));
    }
    let method = parts[0];
    let uri = parts[1];
    let version = parts[2];

    if method == "CONNECT" {
      Self::handle_connect(stream, peer_addr, uri, config, hooks, interceptor).await
    } else {
      Self::handle_plain(
        stream,
        peer_addr,
        method,
        uri,
        version,
        config,
        hooks,
        interceptor,
      )
      .await
    }
  }

  /// CONNECT tunnel: acknowledge, terminate TLS with a minted leaf, and
  /// relay decrypted flows to the named host.
  async fn handle_connect(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    uri: &str,
    config: ProxyConfig,
    hooks: Arc<RwLock<HookRegistry>>,
    interceptor: Arc<TlsInterceptor>,
  ) -> Result<()> {
    let (host, port) = split_host_port(uri, 443);
    if host.is_empty() {
      let _ = stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
        .await;
      return Err(Error::protocol(format!("malformed CONNECT target {:?}", uri)));
    }

    // Drain the CONNECT header block byte-wise. Buffered reads could
    // swallow the start of the TLS handshake the client sends next.
    let mut tail = [0u8; 4];
    let mut drained = 0usize;
    let mut byte = [0u8; 1];
    loop {
      let n = stream.read(&mut byte).await?;
      if n == 0 {
        return Ok(());
      }
      drained += 1;
      if drained > MAX_CONNECT_HEADERS {
        return Err(Error::protocol("CONNECT header block too large"));
      }
      tail.rotate_left(1);
      tail[3] = byte[0];
      // the request line already ended in CRLF, so a bare CRLF ends the block
      if &tail[2..] == b"\r\n" && drained == 2 {
        break;
      }
      if &tail == b"\r\n\r\n" {
        break;
      }
    }

    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;

    // client-leg TLS failure (including leaf issuance) fails closed
    let tls_stream = interceptor.accept_client(stream, &host).await?;
    tracing::debug!(client = %peer_addr, host = %host, port, "intercepting tunnel");

    let relay = FlowRelay::new(
      hooks,
      interceptor,
      peer_addr,
      Some((host, port)),
      config.read_timeout,
      config.write_timeout,
    );
    relay.run(tls_stream, None).await
  }

  /// Plain proxy request: finish parsing the message whose request line was
  /// already consumed, then relay on the same connection.
  #[allow(clippy::too_many_arguments)]
  async fn handle_plain(
    stream: TcpStream,
    peer_addr: SocketAddr,
    method: &str,
    uri: &str,
    version: &str,
    config: ProxyConfig,
    hooks: Arc<RwLock<HookRegistry>>,
    interceptor: Arc<TlsInterceptor>,
  ) -> Result<()> {
    let method = http::Method::from_bytes(method.as_bytes())
      .map_err(|_| Error::protocol(format!("invalid method {:?}", method)))?;
    let uri = http::Uri::try_from(uri)
      .map_err(|_| Error::protocol(format!("invalid request target {:?}", uri)))?;
    let version = match version {
      "HTTP/1.0" => http::Version::HTTP_10,
      "HTTP/1.1" => http::Version::HTTP_11,
      other => return Err(Error::protocol(format!("unsupported version {:?}", other))),
    };

    let mut reader = BufReader::new(stream);
    let request = codec::read_request_after_line(&mut reader, method, uri, version).await?;

    let relay = FlowRelay::new(
      hooks,
      interceptor,
      peer_addr,
      None,
      config.read_timeout,
      config.write_timeout,
    );
    // keep the BufReader: it may hold the start of a pipelined request
    relay.run(reader, Some(request)).await
  }
}
