//! Flow relay
//!
//! Drives one client connection: parse a request, run request hooks, forward
//! upstream, parse the response, run response hooks, write the re-framed
//! response back. Loops while both sides keep the connection alive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

use crate::codec::{self, ResponseConfig};
use crate::errors::{Error, Result};
use crate::flow::Flow;
use crate::hooks::HookRegistry;
use crate::request::Request;
use crate::response::Response;
use crate::socket::Socket;
use crate::tls::TlsInterceptor;

/// Relays flows between one client stream and its upstream servers.
pub struct FlowRelay {
  hooks: Arc<RwLock<HookRegistry>>,
  interceptor: Arc<TlsInterceptor>,
  client_addr: SocketAddr,
  /// Set for CONNECT tunnels: every request on this stream goes to this
  /// host over TLS. Absent for plain proxy streams, where each request
  /// names its own target.
  fixed_target: Option<(String, u16)>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}

struct UpstreamConn {
  host: String,
  port: u16,
  reader: BufReader<Socket>,
  reused: bool,
}

impl FlowRelay {
  /// Create a relay for one accepted client stream.
  pub fn new(
    hooks: Arc<RwLock<HookRegistry>>,
    interceptor: Arc<TlsInterceptor>,
    client_addr: SocketAddr,
    fixed_target: Option<(String, u16)>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      hooks,
      interceptor,
      client_addr,
      fixed_target,
      read_timeout,
      write_timeout,
    }
  }

  /// Run the relay loop until either side closes or a fatal error occurs.
  ///
  /// `first` carries a request that was already parsed off the stream by the
  /// acceptor (the plain-proxy path); subsequent requests are parsed here.
  pub async fn run<C>(&self, client: C, first: Option<Request>) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin,
  {
    let mut client = BufReader::new(client);
    let mut upstream: Option<UpstreamConn> = None;
    let mut pending = first;

    loop {
      let request = match pending.take() {
        Some(r) => r,
        None => match self.next_request(&mut client).await {
          Ok(Some(r)) => r,
          Ok(None) => break,
          Err(e) => {
            if matches!(e, Error::Parse(_)) {
              let reply = error_response(http::StatusCode::BAD_REQUEST, "malformed request");
              let _ = self.write_client(&mut client, &reply.to_raw()).await;
            }
            return Err(e);
          }
        },
      };

      let target = match self.fixed_target.clone().or_else(|| request.target()) {
        Some(t) => t,
        None => {
          let reply = error_response(http::StatusCode::BAD_REQUEST, "missing request target");
          self.write_client(&mut client, &reply.to_raw()).await?;
          return Err(Error::protocol("request without resolvable target"));
        }
      };
      let client_wants_close = wants_close(&request);

      let mut flow = Flow::new(self.client_addr, target.clone(), request);
      self.hooks.read().await.fire_request(&mut flow).await;
      let raw_request = prepare_upstream_request(flow.request_mut());
      let response_config = ResponseConfig::new(flow.request(), self.read_timeout);

      let exchange = self
        .exchange(&mut upstream, &target, &raw_request, &response_config)
        .await;
      let response = match exchange {
        Ok(r) => r,
        Err(e) => {
          upstream = None;
          flow.fail(e.to_string());
          self.hooks.read().await.fire_error(&flow).await;
          let reply = error_response(http::StatusCode::BAD_GATEWAY, "upstream request failed");
          // the client leg may already be broken; this write is best effort
          let _ = self.write_client(&mut client, &reply.to_raw()).await;
          return Err(e);
        }
      };

      flow.advance()?;
      let upstream_wants_close = response_closes_upstream(&response);
      flow.set_response(response)?;
      self.hooks.read().await.fire_response(&mut flow).await;
      flow.advance()?;

      let raw = match flow.response() {
        Some(r) => r.to_raw(),
        None => Bytes::new(),
      };
      if let Err(e) = self.write_client(&mut client, &raw).await {
        flow.fail(e.to_string());
        self.hooks.read().await.fire_error(&flow).await;
        return Err(e);
      }
      flow.advance()?;
      flow.advance()?;
      tracing::debug!(flow_id = flow.id(), state = %flow.state(), "flow complete");

      if upstream_wants_close {
        upstream = None;
      }
      if client_wants_close {
        break;
      }
    }
    Ok(())
  }

  /// Parse the next request off the client stream, honoring the idle
  /// timeout. Timeout or clean EOF both end the loop.
  async fn next_request<C>(&self, client: &mut BufReader<C>) -> Result<Option<Request>>
  where
    C: AsyncRead + AsyncWrite + Unpin,
  {
    match self.read_timeout {
      None => codec::read_request(client).await,
      Some(t) => match tokio::time::timeout(t, codec::read_request(client)).await {
        Ok(result) => result,
        Err(_) => {
          tracing::debug!(client = %self.client_addr, "idle connection timed out");
          Ok(None)
        }
      },
    }
  }

  /// Write the request upstream and parse the response, reconnecting once
  /// when a reused connection turns out to be dead.
  async fn exchange(
    &self,
    upstream: &mut Option<UpstreamConn>,
    target: &(String, u16),
    raw_request: &Bytes,
    config: &ResponseConfig,
  ) -> Result<Response> {
    let mut conn = match upstream.take() {
      Some(c) if c.host == target.0 && c.port == target.1 => c,
      _ => self.dial(target).await?,
    };

    // a kept-alive connection can go stale between exchanges; redial only
    // while no response byte has arrived, so a request the server may have
    // processed is never re-issued
    if conn.reused && !self.send_and_probe(&mut conn, raw_request).await? {
      tracing::debug!("reused upstream connection is stale, redialing");
      conn = self.dial(target).await?;
    }
    if !conn.reused {
      send_request(&mut conn, raw_request).await?;
    }
    let response = codec::read_response(&mut conn.reader, config).await?;
    conn.reused = true;
    *upstream = Some(conn);
    Ok(response)
  }

  /// Send the request on a pooled connection and wait for the first response
  /// byte without consuming it. `false` means the connection died before any
  /// byte arrived, the only point where a resend is safe.
  async fn send_and_probe(&self, conn: &mut UpstreamConn, raw_request: &Bytes) -> Result<bool> {
    if send_request(conn, raw_request).await.is_err() {
      return Ok(false);
    }
    let first = match self.read_timeout {
      None => conn.reader.fill_buf().await,
      Some(t) => tokio::time::timeout(t, conn.reader.fill_buf())
        .await
        .map_err(|_| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, "upstream read timed out"))?,
    };
    Ok(matches!(first, Ok(buf) if !buf.is_empty()))
  }

  async fn dial(&self, target: &(String, u16)) -> Result<UpstreamConn> {
    let socket = if self.fixed_target.is_some() {
      self.interceptor.connect_upstream(&target.0, target.1).await?
    } else {
      self.interceptor.connect_plain(&target.0, target.1).await?
    };
    Ok(UpstreamConn {
      host: target.0.clone(),
      port: target.1,
      reader: BufReader::new(socket),
      reused: false,
    })
  }

  async fn write_client<C>(&self, client: &mut BufReader<C>, raw: &[u8]) -> Result<()>
  where
    C: AsyncRead + AsyncWrite + Unpin,
  {
    let write = async {
      client.get_mut().write_all(raw).await?;
      client.get_mut().flush().await
    };
    match self.write_timeout {
      None => write.await?,
      Some(t) => tokio::time::timeout(t, write)
        .await
        .map_err(|_| crate::errors::new_io_error(std::io::ErrorKind::TimedOut, "client write timed out"))??,
    }
    Ok(())
  }
}

async fn send_request(conn: &mut UpstreamConn, raw_request: &Bytes) -> Result<()> {
  conn.reader.get_mut().write_all(raw_request).await?;
  conn.reader.get_mut().flush().await?;
  Ok(())
}

/// Serialize the request for the upstream leg.
///
/// `Accept-Encoding` is pinned to identity so bodies arrive in a form hooks
/// can read, and the hop-by-hop `Proxy-Connection` header is dropped.
fn prepare_upstream_request(request: &mut Request) -> Bytes {
  request
    .headers_mut()
    .insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
  request.remove_header("proxy-connection");
  request.to_raw()
}

fn wants_close(request: &Request) -> bool {
  let connection = request
    .header(http::header::CONNECTION)
    .unwrap_or_default()
    .to_ascii_lowercase();
  if connection.contains("close") {
    return true;
  }
  request.version() == http::Version::HTTP_10 && !connection.contains("keep-alive")
}

/// Whether the upstream connection can be reused after this response.
fn response_closes_upstream(response: &Response) -> bool {
  let connection = response
    .header(http::header::CONNECTION)
    .unwrap_or_default()
    .to_ascii_lowercase();
  if connection.contains("close") {
    return true;
  }
  // an EOF-framed body consumes the connection
  let bodyless = response.status_code().is_informational()
    || response.status_code() == http::StatusCode::NO_CONTENT
    || response.status_code() == http::StatusCode::NOT_MODIFIED;
  !bodyless && !response.is_chunked() && response.content_length().is_none() && response.body().is_some()
}

fn error_response(status: http::StatusCode, message: &str) -> Response {
  let builder = Response::builder()
    .status(status)
    .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
    .header(http::header::CONNECTION, "close")
    .header(http::header::CONTENT_LENGTH, message.len());
  match builder.body(Bytes::from(message.to_string())) {
    Ok(r) => r.into(),
    Err(_) => Response::default(),
  }
}
