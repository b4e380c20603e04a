//! Interpose
//!
//! An intercepting HTTP/HTTPS forward proxy. CONNECT tunnels are terminated
//! with certificates minted by a local CA, decrypted HTTP/1.1 flows pass
//! through a hook registry that can observe and rewrite them, and everything
//! is re-encrypted toward the real upstream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use interpose::{InjectConfig, Proxy, ProxyConfig, ScriptInjector};
//!
//! #[tokio::main]
//! async fn main() -> interpose::Result<()> {
//!   let proxy = Proxy::new(ProxyConfig::default()).await?;
//!   let inject = InjectConfig::default();
//!   proxy.hooks().write().await.add_response_hook(Arc::new(
//!     ScriptInjector::new(inject.script, inject.host_suffixes, inject.content_type),
//!   ));
//!   proxy.run("127.0.0.1:8080").await
//! }
//! ```

pub mod body;
pub mod ca;
pub mod codec;
pub mod config;
pub mod connector;
pub mod errors;
pub mod flow;
pub mod hooks;
pub mod inject;
pub mod relay;
pub mod request;
pub mod response;
pub mod server;
pub mod socket;
pub mod tls;

pub use body::Body;
pub use ca::{CertificateAuthority, CertificateStore};
pub use config::{InjectConfig, ProxyConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Leg, Result};
pub use flow::{Flow, FlowState};
pub use hooks::{ErrorHook, HookRegistry, LogHook, RequestHook, ResponseHook};
pub use inject::ScriptInjector;
pub use relay::FlowRelay;
pub use request::Request;
pub use response::Response;
pub use server::Proxy;
pub use socket::Socket;
pub use tls::TlsInterceptor;

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const SPACE: &[u8] = b" ";
pub(crate) const COLON_SPACE: &[u8] = b": ";
