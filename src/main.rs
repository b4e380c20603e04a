use std::sync::Arc;

use interpose::{InjectConfig, LogHook, Proxy, ProxyConfig, ScriptInjector};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> interpose::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut args = std::env::args().skip(1);
  let addr = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_string());

  let mut inject = InjectConfig::default();
  if let Some(script_path) = args.next() {
    inject.script = tokio::fs::read_to_string(&script_path).await?;
    tracing::info!("loaded injection payload from {}", script_path);
  } else {
    tracing::warn!("no script file given, running as a pass-through proxy");
  }

  let proxy = Proxy::new(ProxyConfig::default()).await?;
  tracing::info!(
    "trust the CA certificate at {}",
    proxy.certs().root_cert_path().display()
  );

  {
    let hooks = proxy.hooks();
    let mut hooks = hooks.write().await;
    hooks.add_request_hook(Arc::new(LogHook));
    hooks.add_response_hook(Arc::new(LogHook));
    hooks.add_error_hook(Arc::new(LogHook));
    if !inject.script.is_empty() {
      hooks.add_response_hook(Arc::new(ScriptInjector::new(
        inject.script,
        inject.host_suffixes,
        inject.content_type,
      )));
    }
  }

  proxy.run(&addr).await
}
