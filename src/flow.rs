//! Flow tracking
//!
//! A [`Flow`] is one request/response exchange through the proxy, carried
//! through the hook callbacks and advanced through a linear state machine
//! by the relay.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Where a flow stands in its lifecycle.
///
/// Transitions are strictly linear; `Error` is reachable from any
/// non-terminal state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
  /// Flow created, nothing parsed yet.
  New,
  /// The client request has been parsed.
  RequestReceived,
  /// The (possibly mutated) request has been written upstream.
  RequestForwarded,
  /// The upstream response has been parsed.
  ResponseReceived,
  /// Response hooks have run.
  ResponseHooksApplied,
  /// The (possibly mutated) response has been written to the client.
  ResponseForwarded,
  /// Exchange complete.
  Done,
  /// The flow failed; see [`Flow::error`].
  Error,
}

impl FlowState {
  fn next(self) -> Option<FlowState> {
    match self {
      FlowState::New => Some(FlowState::RequestReceived),
      FlowState::RequestReceived => Some(FlowState::RequestForwarded),
      FlowState::RequestForwarded => Some(FlowState::ResponseReceived),
      FlowState::ResponseReceived => Some(FlowState::ResponseHooksApplied),
      FlowState::ResponseHooksApplied => Some(FlowState::ResponseForwarded),
      FlowState::ResponseForwarded => Some(FlowState::Done),
      FlowState::Done | FlowState::Error => None,
    }
  }
}

impl fmt::Display for FlowState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      FlowState::New => "new",
      FlowState::RequestReceived => "request_received",
      FlowState::RequestForwarded => "request_forwarded",
      FlowState::ResponseReceived => "response_received",
      FlowState::ResponseHooksApplied => "response_hooks_applied",
      FlowState::ResponseForwarded => "response_forwarded",
      FlowState::Done => "done",
      FlowState::Error => "error",
    };
    f.write_str(name)
  }
}

/// One intercepted exchange.
#[derive(Debug, Clone)]
pub struct Flow {
  id: u64,
  client_addr: SocketAddr,
  target: (String, u16),
  request: Request,
  response: Option<Response>,
  state: FlowState,
  error: Option<String>,
  created_at_ms: u64,
  completed_at_ms: Option<u64>,
}

fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

impl Flow {
  /// Create a flow for a freshly parsed request, in `RequestReceived`.
  pub fn new(client_addr: SocketAddr, target: (String, u16), request: Request) -> Self {
    Self {
      id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
      client_addr,
      target,
      request,
      response: None,
      state: FlowState::RequestReceived,
      error: None,
      created_at_ms: now_ms(),
      completed_at_ms: None,
    }
  }

  /// Process-unique flow identifier.
  #[inline]
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Address of the intercepted client.
  #[inline]
  pub fn client_addr(&self) -> SocketAddr {
    self.client_addr
  }

  /// The `host:port` this flow is addressed to.
  #[inline]
  pub fn target(&self) -> (&str, u16) {
    (&self.target.0, self.target.1)
  }

  /// The request, as hooks currently see it.
  #[inline]
  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Mutable access to the request, for request hooks.
  #[inline]
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }

  /// The response, once one has been received.
  #[inline]
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }

  /// Mutable access to the response, for response hooks.
  #[inline]
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }

  /// Current lifecycle state.
  #[inline]
  pub fn state(&self) -> FlowState {
    self.state
  }

  /// The failure recorded by [`Flow::fail`], if any.
  #[inline]
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Creation timestamp, milliseconds since the epoch.
  #[inline]
  pub fn created_at_ms(&self) -> u64 {
    self.created_at_ms
  }

  /// Completion timestamp, set on `Done` or `Error`.
  #[inline]
  pub fn completed_at_ms(&self) -> Option<u64> {
    self.completed_at_ms
  }

  /// The host this flow targets, normalized for matching.
  pub fn pretty_host(&self) -> String {
    let from_request = self.request.pretty_host();
    if from_request.is_empty() {
      crate::request::normalize_host(&self.target.0)
    } else {
      from_request
    }
  }

  /// Advance to the next lifecycle state.
  ///
  /// States are never skipped; advancing a terminal flow is a bug in the
  /// relay and reported as a protocol error.
  pub fn advance(&mut self) -> Result<()> {
    match self.state.next() {
      Some(next) => {
        self.state = next;
        if next == FlowState::Done {
          self.completed_at_ms = Some(now_ms());
        }
        Ok(())
      }
      None => Err(Error::protocol(format!(
        "flow {} cannot advance from terminal state {}",
        self.id, self.state
      ))),
    }
  }

  /// Attach the upstream response.
  ///
  /// Only valid once the request has been forwarded; a flow never carries a
  /// response before that point.
  pub fn set_response(&mut self, response: Response) -> Result<()> {
    if self.state != FlowState::RequestForwarded {
      return Err(Error::protocol(format!(
        "flow {} received a response in state {}",
        self.id, self.state
      )));
    }
    self.response = Some(response);
    self.advance()
  }

  /// Mark the flow failed with `message`. Terminal.
  pub fn fail(&mut self, message: impl Into<String>) {
    self.state = FlowState::Error;
    self.error = Some(message.into());
    self.completed_at_ms = Some(now_ms());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn test_flow() -> Flow {
    let request: Request = Request::builder()
      .method("GET")
      .uri("/")
      .header(http::header::HOST, "example.com")
      .body(Bytes::new())
      .unwrap()
      .into();
    Flow::new(
      "127.0.0.1:4000".parse().unwrap(),
      ("example.com".to_string(), 443),
      request,
    )
  }

  #[test]
  fn states_advance_in_order_without_skips() {
    let mut flow = test_flow();
    assert_eq!(flow.state(), FlowState::RequestReceived);
    flow.advance().unwrap();
    assert_eq!(flow.state(), FlowState::RequestForwarded);
    flow
      .set_response(crate::response::Response::default())
      .unwrap();
    assert_eq!(flow.state(), FlowState::ResponseReceived);
    flow.advance().unwrap();
    flow.advance().unwrap();
    flow.advance().unwrap();
    assert_eq!(flow.state(), FlowState::Done);
    assert!(flow.completed_at_ms().is_some());
    assert!(flow.advance().is_err());
  }

  #[test]
  fn response_rejected_before_forwarding() {
    let mut flow = test_flow();
    assert!(flow
      .set_response(crate::response::Response::default())
      .is_err());
  }

  #[test]
  fn fail_is_terminal_from_any_state() {
    let mut flow = test_flow();
    flow.fail("upstream unreachable");
    assert_eq!(flow.state(), FlowState::Error);
    assert_eq!(flow.error(), Some("upstream unreachable"));
    assert!(flow.advance().is_err());
  }

  #[test]
  fn ids_are_unique() {
    let a = test_flow();
    let b = test_flow();
    assert_ne!(a.id(), b.id());
  }
}
