//! HTML script injection hook
//!
//! For responses from configured hosts whose content-type matches, removes
//! every `Content-Security-Policy` header and inserts a script payload just
//! before the first `</head>`.

use async_trait::async_trait;

use crate::errors::Result;
use crate::flow::Flow;
use crate::hooks::ResponseHook;

/// Response hook that rewrites matching HTML documents.
pub struct ScriptInjector {
  payload: String,
  host_suffixes: Vec<String>,
  content_type: String,
}

impl ScriptInjector {
  /// Create an injector for `payload` on hosts matching any of
  /// `host_suffixes`, for responses whose content-type contains
  /// `content_type`.
  pub fn new(
    payload: impl Into<String>,
    host_suffixes: Vec<String>,
    content_type: impl Into<String>,
  ) -> Self {
    Self {
      payload: payload.into(),
      host_suffixes,
      content_type: content_type.into(),
    }
  }

  fn matches_host(&self, host: &str) -> bool {
    self.host_suffixes.iter().any(|s| host.ends_with(s.as_str()))
  }
}

#[async_trait]
impl ResponseHook for ScriptInjector {
  async fn on_response(&self, flow: &mut Flow) -> Result<()> {
    if !self.matches_host(&flow.pretty_host()) {
      return Ok(());
    }
    let flow_id = flow.id();
    let response = match flow.response_mut() {
      Some(r) => r,
      None => return Ok(()),
    };
    let content_type = response
      .header(http::header::CONTENT_TYPE)
      .unwrap_or_default();
    if !content_type.contains(&self.content_type) {
      return Ok(());
    }

    response.remove_header(http::header::CONTENT_SECURITY_POLICY);

    let html = response.text()?;
    let tag = format!("<script>{}</script>", self.payload);
    // already carries the payload (e.g. a replayed response), leave it alone
    if html.contains(&tag) {
      return Ok(());
    }
    if !html.contains("</head>") {
      return Ok(());
    }
    let rewritten = html.replacen("</head>", &format!("{}</head>", tag), 1);
    response.set_text(&rewritten);
    tracing::debug!(flow_id, "injected script payload");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Request;
  use crate::response::Response;
  use bytes::Bytes;

  const PAYLOAD: &str = "console.log('hi')";

  fn injector() -> ScriptInjector {
    ScriptInjector::new(PAYLOAD, vec!["tradingview.com".to_string()], "text/html")
  }

  fn flow_for(host: &str, content_type: &str, body: &str) -> Flow {
    let request: Request = Request::builder()
      .method("GET")
      .uri("/chart")
      .header(http::header::HOST, host)
      .body(Bytes::new())
      .unwrap()
      .into();
    let mut flow = Flow::new(
      "127.0.0.1:6000".parse().unwrap(),
      (host.to_string(), 443),
      request,
    );
    flow.advance().unwrap();
    let response: Response = Response::builder()
      .status(200)
      .header(http::header::CONTENT_TYPE, content_type)
      .header("Content-Security-Policy", "default-src 'self'")
      .header("content-security-policy", "frame-ancestors 'none'")
      .header(http::header::CONTENT_LENGTH, body.len())
      .body(Bytes::from(body.to_string()))
      .unwrap()
      .into();
    flow.set_response(response).unwrap();
    flow
  }

  #[tokio::test]
  async fn injects_before_first_head_close_and_fixes_length() {
    let mut flow = flow_for(
      "www.tradingview.com",
      "text/html; charset=utf-8",
      "<html><head><title>t</title></head><body></body></html>",
    );
    injector().on_response(&mut flow).await.unwrap();
    let response = flow.response().unwrap();
    let html = response.text().unwrap();
    let expected = format!(
      "<html><head><title>t</title><script>{}</script></head><body></body></html>",
      PAYLOAD
    );
    assert_eq!(html, expected);
    assert_eq!(response.content_length(), Some(expected.len() as u64));
    assert!(response
      .header(http::header::CONTENT_SECURITY_POLICY)
      .is_none());
  }

  #[tokio::test]
  async fn only_first_head_close_is_rewritten() {
    let mut flow = flow_for(
      "tradingview.com",
      "text/html",
      "<head></head><head></head>",
    );
    injector().on_response(&mut flow).await.unwrap();
    let html = flow.response().unwrap().text().unwrap();
    assert_eq!(html.matches("<script>").count(), 1);
    assert!(html.starts_with(&format!("<head><script>{}</script></head>", PAYLOAD)));
  }

  #[tokio::test]
  async fn applying_twice_does_not_duplicate() {
    let mut flow = flow_for(
      "tradingview.com",
      "text/html",
      "<html><head></head></html>",
    );
    let hook = injector();
    hook.on_response(&mut flow).await.unwrap();
    let once = flow.response().unwrap().text().unwrap();
    hook.on_response(&mut flow).await.unwrap();
    let twice = flow.response().unwrap().text().unwrap();
    assert_eq!(once, twice);
    assert_eq!(twice.matches(PAYLOAD).count(), 1);
    assert_eq!(twice.matches("</head>").count(), 1);
  }

  #[tokio::test]
  async fn csp_removed_even_without_head_close() {
    let mut flow = flow_for("tradingview.com", "text/html", "<body>no head</body>");
    injector().on_response(&mut flow).await.unwrap();
    let response = flow.response().unwrap();
    assert!(response
      .header(http::header::CONTENT_SECURITY_POLICY)
      .is_none());
    assert_eq!(response.text().unwrap(), "<body>no head</body>");
  }

  #[tokio::test]
  async fn non_matching_host_passes_through_untouched() {
    let body = "<html><head></head></html>";
    let mut flow = flow_for("example.com", "text/html", body);
    let before = flow.response().unwrap().to_raw();
    injector().on_response(&mut flow).await.unwrap();
    assert_eq!(flow.response().unwrap().to_raw(), before);
  }

  #[tokio::test]
  async fn non_html_content_type_passes_through_untouched() {
    let body = "{\"head\": \"</head>\"}";
    let mut flow = flow_for("tradingview.com", "application/json", body);
    let before = flow.response().unwrap().to_raw();
    injector().on_response(&mut flow).await.unwrap();
    assert_eq!(flow.response().unwrap().to_raw(), before);
  }
}
