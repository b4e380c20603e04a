use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};

use crate::body::Body;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An intercepted HTTP request, mutable by request hooks.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`.
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }

  /// Serialize the request back to wire bytes in origin-form.
  ///
  /// A `Host` header is synthesized from the URI authority when missing.
  /// When the request is chunked the body is re-chunked as a single data
  /// chunk; otherwise `Content-Length` is recomputed from the body so the
  /// declared length can never disagree with the actual byte count.
  pub fn to_raw(&self) -> Bytes {
    let mut buf = Vec::new();
    buf.extend(self.method.as_str().as_bytes());
    buf.extend(SPACE);
    let path = self.uri.path();
    buf.extend(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(q) = self.uri.query() {
      buf.extend(b"?");
      buf.extend(q.as_bytes());
    }
    buf.extend(SPACE);
    buf.extend(format!("{:?}", self.version).as_bytes());
    buf.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        buf.extend(http::header::HOST.as_str().as_bytes());
        buf.extend(COLON_SPACE);
        buf.extend(authority.as_str().as_bytes());
        buf.extend(CR_LF);
      }
    }
    let chunked = self.is_chunked();
    let mut headers = self.headers.clone();
    if chunked {
      // chunked framing carries its own length
      headers.remove(http::header::CONTENT_LENGTH);
    } else if let Some(b) = self.body() {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
    }
    for (k, v) in headers.iter() {
      buf.extend(k.as_str().as_bytes());
      buf.extend(COLON_SPACE);
      buf.extend(v.as_bytes());
      buf.extend(CR_LF);
    }
    buf.extend(CR_LF);
    match self.body() {
      Some(b) if chunked => {
        if !b.is_empty() {
          buf.extend(format!("{:x}", b.len()).as_bytes());
          buf.extend(CR_LF);
          buf.extend(b.as_ref());
          buf.extend(CR_LF);
        }
        buf.extend(b"0");
        buf.extend(CR_LF);
        buf.extend(CR_LF);
      }
      Some(b) => buf.extend(b.as_ref()),
      None if chunked => {
        buf.extend(b"0");
        buf.extend(CR_LF);
        buf.extend(CR_LF);
      }
      None => {}
    }
    Bytes::from(buf)
  }

  /// Whether the request declares `Transfer-Encoding: chunked`.
  pub fn is_chunked(&self) -> bool {
    self
      .headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false)
  }
}

impl Request {
  /// Get the HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Get a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }

  /// Get the request target URI.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }

  /// Get a mutable reference to the target URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }

  /// Get the request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the request body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Replace the request body.
  #[inline]
  pub fn set_body<T: Into<Body>>(&mut self, body: T) {
    self.body = Some(body.into());
  }

  /// Get the HTTP version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// Get a mutable reference to the version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }

  /// Get the first value of a header by name, if present and valid UTF-8.
  pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<String> {
    self
      .headers
      .get(name)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_string())
  }

  /// Remove all occurrences of a header, returning the first removed value.
  ///
  /// Header names match case-insensitively; `HeaderMap::remove` drops every
  /// value associated with the name.
  pub fn remove_header(&mut self, name: impl http::header::AsHeaderName) -> Option<HeaderValue> {
    self.headers.remove(name)
  }

  /// The host this request is addressed to, in a display-friendly form.
  ///
  /// Prefers the `Host` header over the URI authority; the port and any
  /// trailing dot are stripped, and the name is lowercased.
  pub fn pretty_host(&self) -> String {
    let raw = self
      .header(http::header::HOST)
      .or_else(|| self.uri.host().map(|h| h.to_string()))
      .unwrap_or_default();
    normalize_host(&raw)
  }

  /// The `host:port` pair this request targets, for upstream connection.
  ///
  /// Derived from the absolute-form URI when present, else the `Host`
  /// header. The port defaults by scheme (443 for https, else 80).
  pub fn target(&self) -> Option<(String, u16)> {
    let default_port = match self.uri.scheme_str() {
      Some("https") => 443,
      _ => 80,
    };
    if let Some(authority) = self.uri.authority() {
      return Some((
        authority.host().to_string(),
        authority.port_u16().unwrap_or(default_port),
      ));
    }
    let host = self.header(http::header::HOST)?;
    Some(split_host_port(&host, default_port))
  }
}

/// Strip the port and trailing dot from a host, lowercasing the result.
pub(crate) fn normalize_host(raw: &str) -> String {
  let (host, _) = split_host_port(raw, 0);
  host.trim_end_matches('.').to_ascii_lowercase()
}

/// Split a `host[:port]` string, handling bracketed IPv6 literals.
pub(crate) fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
  if let Some(rest) = raw.strip_prefix('[') {
    // [::1]:8443 or [::1]
    if let Some((host, tail)) = rest.split_once(']') {
      let port = tail
        .strip_prefix(':')
        .and_then(|p| p.parse().ok())
        .unwrap_or(default_port);
      return (host.to_string(), port);
    }
  }
  match raw.rsplit_once(':') {
    // a second colon means an unbracketed IPv6 literal, not a port
    Some((host, port)) if !host.contains(':') => (
      host.to_string(),
      port.parse().unwrap_or(default_port),
    ),
    _ => (raw.to_string(), default_port),
  }
}
