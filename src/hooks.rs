//! Hook registry
//!
//! Hooks observe and mutate flows at the two interception points. A failing
//! hook is isolated: its partial edits are rolled back and the remaining
//! hooks still run, so one bad callback cannot take a flow down.

use std::sync::Arc;

use crate::errors::Result;
use crate::flow::Flow;

/// A callback invoked after the client request is parsed, before it is
/// forwarded upstream.
#[async_trait::async_trait]
pub trait RequestHook: Send + Sync {
  /// Inspect or mutate the request carried by `flow`.
  async fn on_request(&self, flow: &mut Flow) -> Result<()>;
}

/// A callback invoked after the upstream response is parsed, before it is
/// written back to the client.
#[async_trait::async_trait]
pub trait ResponseHook: Send + Sync {
  /// Inspect or mutate the response carried by `flow`.
  async fn on_response(&self, flow: &mut Flow) -> Result<()>;
}

/// A callback invoked when a flow fails.
#[async_trait::async_trait]
pub trait ErrorHook: Send + Sync {
  /// Observe a failed flow. Purely informational.
  async fn on_error(&self, flow: &Flow);
}

/// Ordered collection of hooks.
#[derive(Default)]
pub struct HookRegistry {
  request_hooks: Vec<Arc<dyn RequestHook>>,
  response_hooks: Vec<Arc<dyn ResponseHook>>,
  error_hooks: Vec<Arc<dyn ErrorHook>>,
}

impl HookRegistry {
  /// Create an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a request hook; hooks run in registration order.
  pub fn add_request_hook(&mut self, hook: Arc<dyn RequestHook>) {
    self.request_hooks.push(hook);
  }

  /// Append a response hook; hooks run in registration order.
  pub fn add_response_hook(&mut self, hook: Arc<dyn ResponseHook>) {
    self.response_hooks.push(hook);
  }

  /// Append an error hook.
  pub fn add_error_hook(&mut self, hook: Arc<dyn ErrorHook>) {
    self.error_hooks.push(hook);
  }

  /// Run all request hooks over `flow`.
  ///
  /// The request is snapshotted before each hook; when a hook errors, the
  /// request is restored to how it stood before that hook and the remaining
  /// hooks still run.
  pub async fn fire_request(&self, flow: &mut Flow) {
    for hook in &self.request_hooks {
      let snapshot = flow.request().clone();
      if let Err(e) = hook.on_request(flow).await {
        tracing::warn!(flow_id = flow.id(), "request hook failed: {}", e);
        *flow.request_mut() = snapshot;
      }
    }
  }

  /// Run all response hooks over `flow`, with the same isolation as
  /// [`HookRegistry::fire_request`]. A no-op when the flow carries no
  /// response.
  pub async fn fire_response(&self, flow: &mut Flow) {
    for hook in &self.response_hooks {
      let snapshot = match flow.response() {
        Some(r) => r.clone(),
        None => return,
      };
      if let Err(e) = hook.on_response(flow).await {
        tracing::warn!(flow_id = flow.id(), "response hook failed: {}", e);
        if let Some(response) = flow.response_mut() {
          *response = snapshot;
        }
      }
    }
  }

  /// Notify error hooks of a failed flow.
  pub async fn fire_error(&self, flow: &Flow) {
    for hook in &self.error_hooks {
      hook.on_error(flow).await;
    }
  }
}

/// Traffic logger, registered by the binary.
pub struct LogHook;

#[async_trait::async_trait]
impl RequestHook for LogHook {
  async fn on_request(&self, flow: &mut Flow) -> Result<()> {
    tracing::info!(
      flow_id = flow.id(),
      client = %flow.client_addr(),
      "{} {} {}",
      flow.request().method(),
      flow.pretty_host(),
      flow.request().uri()
    );
    Ok(())
  }
}

#[async_trait::async_trait]
impl ResponseHook for LogHook {
  async fn on_response(&self, flow: &mut Flow) -> Result<()> {
    if let Some(response) = flow.response() {
      tracing::info!(
        flow_id = flow.id(),
        "{} {} bytes",
        response.status_code(),
        response.body().map(|b| b.len()).unwrap_or(0)
      );
    }
    Ok(())
  }
}

#[async_trait::async_trait]
impl ErrorHook for LogHook {
  async fn on_error(&self, flow: &Flow) {
    tracing::warn!(
      flow_id = flow.id(),
      state = %flow.state(),
      "flow failed: {}",
      flow.error().unwrap_or("unknown")
    );
  }
}
