//! Error types for the interception engine

use std::fmt;
use std::io;
use thiserror::Error;

/// A `Result` alias where the `Err` case is `interpose::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of an intercepted exchange a TLS handshake failed on.
///
/// The relay needs to tell the two apart: a broken client leg means the
/// connection is dead, while a broken upstream leg can still be reported
/// back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
  /// The client-facing (terminating) side.
  Client,
  /// The upstream (re-encrypting) side.
  Upstream,
}

impl fmt::Display for Leg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Leg::Client => f.write_str("client"),
      Leg::Upstream => f.write_str("upstream"),
    }
  }
}

/// The errors that may occur while intercepting traffic.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Malformed CONNECT or request line
  #[error("protocol error: {0}")]
  Protocol(String),

  /// Malformed HTTP message framing
  #[error("parse error: {0}")]
  Parse(String),

  /// TLS handshake failure on one leg of an intercepted connection
  #[error("TLS handshake failed on {leg} leg: {message}")]
  TlsHandshake {
    /// The leg the handshake failed on.
    leg: Leg,
    /// Handshake failure detail.
    message: String,
  },

  /// Certificate authority failure (root load or leaf signing)
  #[error("certificate authority error: {0}")]
  Ca(String),

  /// Hook callback failure, isolated per callback and never fatal to a flow
  #[error("hook error: {0}")]
  Hook(String),

  /// http crate error
  #[error(transparent)]
  Http(#[from] http::Error),
}

impl Error {
  /// Create a protocol error and log it.
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a parse error and log it.
  pub fn parse(msg: impl Into<String>) -> Self {
    let error = Error::Parse(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS handshake error for the given leg and log it.
  pub fn tls_handshake(leg: Leg, msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake {
      leg,
      message: msg.into(),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate authority error and log it.
  pub fn ca(msg: impl Into<String>) -> Self {
    let error = Error::Ca(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a hook error.
  pub fn hook(msg: impl Into<String>) -> Self {
    Error::Hook(msg.into())
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}
