//! Proxy configuration

use std::path::PathBuf;
use std::time::Duration;

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Directory the CA root certificate and key are persisted in.
  pub ca_storage_path: PathBuf,
  /// Validate upstream server certificates.
  pub verify_upstream: bool,
  /// Per-read timeout on both legs.
  pub read_timeout: Option<Duration>,
  /// Per-write timeout on both legs.
  pub write_timeout: Option<Duration>,
  /// Upstream connect timeout.
  pub connect_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".interpose"),
      verify_upstream: true,
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
    }
  }
}

/// Settings for the HTML injection hook.
#[derive(Debug, Clone)]
pub struct InjectConfig {
  /// Script payload inserted before `</head>`.
  pub script: String,
  /// Host suffixes the hook applies to.
  pub host_suffixes: Vec<String>,
  /// Substring a response content-type must contain.
  pub content_type: String,
}

impl Default for InjectConfig {
  fn default() -> Self {
    Self {
      script: String::new(),
      host_suffixes: vec!["tradingview.com".to_string()],
      content_type: "text/html".to_string(),
    }
  }
}
