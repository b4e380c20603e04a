use std::fmt::Debug;

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use http::{HeaderValue, Response as HttpResponse};
use mime::Mime;

use crate::body::Body;
use crate::errors::Result;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An intercepted HTTP response, mutable by response hooks.
///
/// The body is always fully buffered and decoded (chunked framing and gzip
/// content-encoding are undone at parse time), so hooks observe and mutate
/// it as a whole. Framing metadata is corrected when the response is
/// serialized back to the wire.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  status_code: http::StatusCode,
  headers: http::HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// An HTTP response builder.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// Get the `StatusCode` of this response.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }

  /// Get the HTTP `Version` of this response.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }

  /// Get the headers of this response.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }

  /// Get the full response body, if any.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  /// Replace the response body without touching framing headers.
  ///
  /// Prefer [`Response::set_text`] for textual rewrites; it keeps
  /// `Content-Length` consistent.
  #[inline]
  pub fn set_body<T: Into<Body>>(&mut self, body: T) {
    self.body = Some(body.into());
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

  /// Get the declared content-length of the response, if any.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }

  /// Whether the response declares chunked transfer-encoding.
  pub fn is_chunked(&self) -> bool {
    self
      .headers
      .get(http::header::TRANSFER_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false)
  }

  /// The charset this body should be decoded and re-encoded with, from the
  /// `charset` parameter of `Content-Type`, defaulting to utf-8.
  fn encoding(&self, default_encoding: &str) -> &'static Encoding {
    let content_type = self
      .headers
      .get(http::header::CONTENT_TYPE)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.parse::<Mime>().ok());
    let label = content_type
      .as_ref()
      .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
      .unwrap_or(default_encoding)
      .to_string();
    Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8)
  }

  /// Decode the body as text using the given fallback encoding label.
  pub fn text_with_charset(&self, default_encoding: &str) -> Result<String> {
    let body = match self.body() {
      Some(b) => b,
      None => return Ok(String::new()),
    };
    let encoding = self.encoding(default_encoding);
    let (text, _, _) = encoding.decode(body);
    Ok(text.to_string())
  }

  /// Decode the body as text.
  ///
  /// The encoding is taken from the `charset` parameter of the
  /// `Content-Type` header and defaults to `utf-8`; malformed sequences are
  /// replaced with the REPLACEMENT CHARACTER.
  pub fn text(&self) -> Result<String> {
    self.text_with_charset("utf-8")
  }

  /// Re-encode `text` as the new body and fix framing metadata.
  ///
  /// The text is encoded with the same charset [`Response::text`] decodes
  /// with. Unless the response is chunked (in which case serialization
  /// re-chunks), `Content-Length` is set to the new byte length.
  pub fn set_text(&mut self, text: &str) {
    let encoding = self.encoding("utf-8");
    let (bytes, _, _) = encoding.encode(text);
    let body = Body::from(bytes.into_owned());
    if !self.is_chunked() {
      self
        .headers
        .insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    self.body = Some(body);
  }

  /// Serialize the response back to wire bytes.
  ///
  /// When the response is chunked the body is re-chunked as a single data
  /// chunk; otherwise `Content-Length` is recomputed from the body so a
  /// declared length can never disagree with the actual byte count.
  pub fn to_raw(&self) -> Bytes {
    let mut buf = Vec::new();
    buf.extend(format!("{:?}", self.version).as_bytes());
    buf.extend(SPACE);
    buf.extend(format!("{}", self.status_code).as_bytes());
    buf.extend(CR_LF);
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
}
