//! HTTP/1.1 wire codec
//!
//! Parses requests and responses from buffered byte streams into the mutable
//! message types and knows exactly where each message ends, so nothing past
//! the boundary is consumed and the underlying connection stays reusable.

use std::future::Future;
use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use http::{HeaderValue, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::{CR_LF, SPACE};

/// Upper bound on a request/status line.
const MAX_LINE_BYTES: usize = 8 * 1024;
/// Upper bound on a header block.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// How a response body should be read for a particular exchange.
#[derive(Debug, Clone)]
pub struct ResponseConfig {
  method: Method,
  read_timeout: Option<Duration>,
}

impl Default for ResponseConfig {
  fn default() -> Self {
    Self {
      method: Method::GET,
      read_timeout: None,
    }
  }
}

impl ResponseConfig {
  /// Configuration for reading the response to `request`.
  pub fn new(request: &Request, read_timeout: Option<Duration>) -> Self {
    ResponseConfig {
      method: request.method().clone(),
      read_timeout,
    }
  }
}

async fn maybe_timeout<F, T>(dur: Option<Duration>, fut: F) -> std::io::Result<T>
where
  F: Future<Output = std::io::Result<T>>,
{
  match dur {
    None => fut.await,
    Some(t) => tokio::time::timeout(t, fut)
      .await
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?,
  }
}

/// Read one `\n`-terminated line, refusing to buffer more than `cap` bytes.
async fn read_line_capped<R>(
  reader: &mut R,
  cap: u64,
  timeout: Option<Duration>,
  line: &mut Vec<u8>,
) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  let n = maybe_timeout(timeout, async {
    let mut limited = reader.take(cap);
    limited.read_until(b'\n', line).await
  })
  .await?;
  if n as u64 == cap && !line.ends_with(b"\n") {
    return Err(Error::parse("line exceeds maximum length"));
  }
  Ok(n)
}

/// Parse one request from the stream.
///
/// Returns `Ok(None)` on a clean EOF before the first byte of a message
/// (the peer closed an idle connection).
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_line_capped(reader, MAX_LINE_BYTES as u64, None, &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  let (method, target, version) = parse_request_line(&line)?;
  let request = read_request_after_line(reader, method, target, version).await?;
  Ok(Some(request))
}

/// Parse the remainder of a request once its request line is consumed.
pub async fn read_request_after_line<R>(
  reader: &mut R,
  method: Method,
  target: http::Uri,
  version: http::Version,
) -> Result<Request>
where
  R: AsyncBufRead + Unpin,
{
  let headers = read_header_block(reader, None).await?;
  let body = if is_chunked(&headers) {
    read_chunked_body(reader, None).await?
  } else if let Some(len) = declared_length(&headers)? {
    read_exact_body(reader, len, None).await?
  } else {
    Vec::new()
  };
  let mut builder = http::Request::builder()
    .method(method)
    .uri(target)
    .version(version);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  let request = builder.body(Bytes::from(body))?;
  Ok(request.into())
}

/// Parse one response from the stream.
///
/// The body is fully buffered: content-length framed bodies are read
/// exactly, chunked bodies are decoded (trailers discarded), and bodies
/// with neither framing are read until the server closes the connection.
/// Gzip content-encoding is undone here so callers always observe the
/// plain body, with the framing headers corrected to match.
pub async fn read_response<R>(reader: &mut R, config: &ResponseConfig) -> Result<Response>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let n = read_line_capped(reader, MAX_LINE_BYTES as u64, config.read_timeout, &mut line).await?;
  if n == 0 {
    return Err(Error::parse("connection closed before status line"));
  }
  let (version, status) = parse_status_line(&line)?;
  let mut headers = read_header_block(reader, config.read_timeout).await?;

  let bodyless = matches!(config.method, Method::HEAD)
    || status.is_informational()
    || status == http::StatusCode::NO_CONTENT
    || status == http::StatusCode::NOT_MODIFIED;
  let mut body = if bodyless {
    Vec::new()
  } else if is_chunked(&headers) {
    read_chunked_body(reader, config.read_timeout).await?
  } else if let Some(len) = declared_length(&headers)? {
    read_exact_body(reader, len, config.read_timeout).await?
  } else {
    read_until_eof(reader, config.read_timeout).await?
  };

  if let Some(ce) = headers.get(http::header::CONTENT_ENCODING) {
    if ce.as_bytes().eq_ignore_ascii_case(b"gzip") && !body.is_empty() {
      let mut decoded = Vec::new();
      let mut d = MultiGzDecoder::new(&body[..]);
      d.read_to_end(&mut decoded)
        .map_err(|e| Error::parse(format!("invalid gzip body: {}", e)))?;
      body = decoded;
      headers.remove(http::header::CONTENT_ENCODING);
      if headers.contains_key(http::header::CONTENT_LENGTH) {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
      }
    }
  }

  let mut builder = http::Response::builder().version(version).status(status);
  if let Some(h) = builder.headers_mut() {
    *h = headers;
  }
  let response = builder.body(Bytes::from(body))?;
  Ok(response.into())
}

fn parse_version(token: &[u8]) -> Result<http::Version> {
  match token {
    b"HTTP/1.0" => Ok(http::Version::HTTP_10),
    b"HTTP/1.1" => Ok(http::Version::HTTP_11),
    _ => Err(Error::parse(format!(
      "unsupported http version {:?}",
      String::from_utf8_lossy(token)
    ))),
  }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, http::Uri, http::Version)> {
  let line = line.strip_suffix(CR_LF).or_else(|| line.strip_suffix(b"\n")).unwrap_or(line);
  let mut parts = line.split(|b| b == &SPACE[0]).filter(|p| !p.is_empty());
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::parse("invalid request line")),
  };
  let method = Method::from_bytes(method).map_err(|_| Error::parse("invalid method"))?;
  let target = http::Uri::try_from(target).map_err(|_| Error::parse("invalid request target"))?;
  let version = parse_version(version)?;
  Ok((method, target, version))
}

fn parse_status_line(line: &[u8]) -> Result<(http::Version, http::StatusCode)> {
  let line = line.strip_suffix(CR_LF).or_else(|| line.strip_suffix(b"\n")).unwrap_or(line);
  let mut parts = line.splitn(3, |b| b == &SPACE[0]);
  let (version, code) = match (parts.next(), parts.next()) {
    (Some(v), Some(c)) if !v.is_empty() && !c.is_empty() => (v, c),
    _ => return Err(Error::parse("invalid status line")),
  };
  let version = parse_version(version)?;
  let status =
    http::StatusCode::try_from(code).map_err(|_| Error::parse("invalid status code"))?;
  Ok((version, status))
}

/// Read header lines up to and including the blank line.
///
/// Obsolete line folding (a field split over a continuation line) is
/// rejected rather than silently merged.
async fn read_header_block<R>(
  reader: &mut R,
  timeout: Option<Duration>,
) -> Result<http::HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = http::HeaderMap::new();
  let mut total = 0usize;
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = read_line_capped(reader, MAX_HEAD_BYTES as u64, timeout, &mut line).await?;
    if n == 0 {
      return Err(Error::parse("connection closed inside header block"));
    }
    total += n;
    if total > MAX_HEAD_BYTES {
      return Err(Error::parse("header block too large"));
    }
    if line == b"\r\n" || line == b"\n" {
      break;
    }
    if line.starts_with(b" ") || line.starts_with(b"\t") {
      return Err(Error::parse("obsolete header folding rejected"));
    }
    let (k, v) = parse_header_line(&line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parse_header_line(buffer: &[u8]) -> Result<(http::HeaderName, HeaderValue)> {
  let buffer = buffer
    .strip_suffix(CR_LF)
    .or_else(|| buffer.strip_suffix(b"\n"))
    .unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |b| b == &b':');
  let name = parts.next().unwrap_or_default();
  let value = match parts.next() {
    Some(v) => v.strip_prefix(SPACE).unwrap_or(v),
    None => return Err(Error::parse("header line without colon")),
  };
  let name =
    http::HeaderName::from_bytes(name).map_err(|_| Error::parse("invalid header name"))?;
  let value =
    HeaderValue::from_bytes(value).map_err(|_| Error::parse("invalid header value"))?;
  Ok((name, value))
}

fn is_chunked(headers: &http::HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn declared_length(headers: &http::HeaderMap) -> Result<Option<usize>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => {
      let len = v
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .ok_or_else(|| Error::parse("invalid content-length"))?;
      Ok(Some(len))
    }
  }
}

async fn read_exact_body<R>(
  reader: &mut R,
  len: usize,
  timeout: Option<Duration>,
) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = vec![0u8; len];
  maybe_timeout(timeout, reader.read_exact(&mut body))
    .await
    .map_err(|e| match e.kind() {
      std::io::ErrorKind::UnexpectedEof => {
        Error::parse("body shorter than declared content-length")
      }
      _ => Error::Io(e),
    })?;
  Ok(body)
}

async fn read_chunked_body<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let mut line = Vec::new();
    let n = read_line_capped(reader, MAX_LINE_BYTES as u64, timeout, &mut line).await?;
    if n == 0 {
      return Err(Error::parse("connection closed inside chunked body"));
    }
    let line = line
      .strip_suffix(CR_LF)
      .or_else(|| line.strip_suffix(b"\n"))
      .unwrap_or(&line[..]);
    // chunk extensions after ';' are ignored
    let size_token = line.split(|b| b == &b';').next().unwrap_or_default();
    let size_str =
      std::str::from_utf8(size_token).map_err(|_| Error::parse("invalid chunk size"))?;
    let size = usize::from_str_radix(size_str.trim(), 16)
      .map_err(|_| Error::parse("invalid chunk size"))?;
    if size == 0 {
      // trailer section, discarded
      loop {
        let mut trailer = Vec::new();
        let n = read_line_capped(reader, MAX_HEAD_BYTES as u64, timeout, &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0u8; size];
    maybe_timeout(timeout, reader.read_exact(&mut chunk))
      .await
      .map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::parse("truncated chunk"),
        _ => Error::Io(e),
      })?;
    body.extend_from_slice(&chunk);
    let mut crlf = [0u8; 2];
    maybe_timeout(timeout, reader.read_exact(&mut crlf))
      .await
      .map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::parse("truncated chunk"),
        _ => Error::Io(e),
      })?;
    if &crlf != b"\r\n" {
      return Err(Error::parse("missing CRLF after chunk"));
    }
  }
  Ok(body)
}

/// Read an EOF-delimited body. A per-read timeout ends the body the way a
/// close would, so a stalled upstream cannot pin the flow forever.
async fn read_until_eof<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  let mut buf = [0u8; 8192];
  loop {
    match maybe_timeout(timeout, reader.read(&mut buf)).await {
      Ok(0) => break,
      Ok(n) => body.extend_from_slice(&buf[..n]),
      Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
      Err(e) => return Err(Error::Io(e)),
    }
  }
  Ok(body)
}
