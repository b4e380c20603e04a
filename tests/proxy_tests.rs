//! End-to-end tests over loopback, plain-HTTP proxying with the injection
//! hook active.

use std::sync::Arc;

use interpose::{LogHook, Proxy, ProxyConfig, ScriptInjector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PAYLOAD: &str = "console.log('injected')";

/// Scripted origin server: answers each request head with the next canned
/// response, on a single connection.
async fn run_origin(listener: TcpListener, responses: Vec<String>) {
  let (mut stream, _) = listener.accept().await.unwrap();
  for response in responses {
    // GET requests only, so the head is the whole message
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
      let n = stream.read(&mut byte).await.unwrap();
      if n == 0 {
        return;
      }
      buf.push(byte[0]);
    }
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
  }
}

async fn start_proxy(ca_dir: &str) -> (std::net::SocketAddr, Arc<Proxy>) {
  let temp_dir = std::env::temp_dir().join(ca_dir);
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }
  let config = ProxyConfig {
    ca_storage_path: temp_dir,
    ..Default::default()
  };
  let proxy = Arc::new(Proxy::new(config).await.unwrap());
  {
    let hooks = proxy.hooks();
    let mut hooks = hooks.write().await;
    hooks.add_request_hook(Arc::new(LogHook));
    hooks.add_response_hook(Arc::new(ScriptInjector::new(
      PAYLOAD,
      vec!["127.0.0.1".to_string()],
      "text/html",
    )));
  }
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serve = proxy.clone();
  tokio::spawn(async move {
    let _ = serve.serve(listener).await;
  });
  (addr, proxy)
}

fn html_origin_response(body: &str) -> String {
  format!(
    "HTTP/1.1 200 OK\r\n\
     Content-Type: text/html; charset=utf-8\r\n\
     Content-Security-Policy: default-src 'self'\r\n\
     Content-Length: {}\r\n\r\n{}",
    body.len(),
    body
  )
}

async fn proxy_get(
  proxy_addr: std::net::SocketAddr,
  origin_addr: std::net::SocketAddr,
  close: bool,
) -> String {
  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let connection = if close { "Connection: close\r\n" } else { "" };
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n{}\r\n",
    origin_addr, origin_addr, connection
  );
  client.write_all(request.as_bytes()).await.unwrap();
  read_one_response(&mut client).await
}

/// Read a single content-length framed response off the stream.
async fn read_one_response(stream: &mut TcpStream) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = stream.read(&mut byte).await.unwrap();
    assert!(n > 0, "connection closed inside response head");
    head.push(byte[0]);
  }
  let head_text = String::from_utf8(head).unwrap();
  let content_length: usize = head_text
    .lines()
    .find_map(|l| {
      let (name, value) = l.split_once(':')?;
      name
        .eq_ignore_ascii_case("content-length")
        .then(|| value.trim().parse().ok())?
    })
    .expect("response must declare content-length");
  let mut body = vec![0u8; content_length];
  stream.read_exact(&mut body).await.unwrap();
  format!("{}{}", head_text, String::from_utf8(body).unwrap())
}

#[tokio::test]
async fn test_html_response_is_rewritten_through_proxy() {
  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-inject").await;

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let origin_body = "<html><head><title>x</title></head><body>hi</body></html>";
  tokio::spawn(run_origin(
    origin_listener,
    vec![html_origin_response(origin_body)],
  ));

  let response = proxy_get(proxy_addr, origin_addr, true).await;

  let expected_body = format!(
    "<html><head><title>x</title><script>{}</script></head><body>hi</body></html>",
    PAYLOAD
  );
  assert!(
    response.ends_with(&expected_body),
    "script was not injected: {}",
    response
  );
  assert!(
    !response.to_ascii_lowercase().contains("content-security-policy"),
    "CSP header survived: {}",
    response
  );
  assert!(
    response.contains(&format!("content-length: {}", expected_body.len())),
    "content-length was not corrected: {}",
    response
  );
}

#[tokio::test]
async fn test_non_html_response_passes_through_unchanged() {
  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-passthrough").await;

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let origin_body = "{\"head\": \"</head>\"}";
  let origin_response = format!(
    "HTTP/1.1 200 OK\r\n\
     Content-Type: application/json\r\n\
     Content-Length: {}\r\n\r\n{}",
    origin_body.len(),
    origin_body
  );
  tokio::spawn(run_origin(origin_listener, vec![origin_response]));

  let response = proxy_get(proxy_addr, origin_addr, true).await;
  assert!(
    response.ends_with(origin_body),
    "non-HTML body was mutated: {}",
    response
  );
}

#[tokio::test]
async fn test_keep_alive_serves_multiple_requests() {
  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-keepalive").await;

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  tokio::spawn(run_origin(
    origin_listener,
    vec![
      html_origin_response("<html><head></head>first</html>"),
      html_origin_response("<html><head></head>second</html>"),
    ],
  ));

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin_addr, origin_addr
  );

  client.write_all(request.as_bytes()).await.unwrap();
  let first = read_one_response(&mut client).await;
  assert!(first.contains("first"), "first response: {}", first);
  assert!(first.contains(PAYLOAD), "first response: {}", first);

  // same client connection, same upstream connection
  client.write_all(request.as_bytes()).await.unwrap();
  let second = read_one_response(&mut client).await;
  assert!(second.contains("second"), "second response: {}", second);
  assert!(second.contains(PAYLOAD), "second response: {}", second);
}

#[tokio::test]
async fn test_stale_upstream_connection_is_redialed() {
  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-redial").await;

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  // one response per connection; the socket the proxy pools goes stale
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = origin_listener.accept().await.unwrap();
      let mut buf = Vec::new();
      let mut byte = [0u8; 1];
      while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
          Ok(0) | Err(_) => break,
          Ok(_) => buf.push(byte[0]),
        }
      }
      let _ = stream
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
        .await;
    }
  });

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin_addr, origin_addr
  );

  client.write_all(request.as_bytes()).await.unwrap();
  let first = read_one_response(&mut client).await;
  assert!(first.starts_with("HTTP/1.1 200"), "first response: {}", first);

  client.write_all(request.as_bytes()).await.unwrap();
  let second = read_one_response(&mut client).await;
  assert!(second.starts_with("HTTP/1.1 200"), "second response: {}", second);
}

#[tokio::test]
async fn test_garbled_reused_upstream_response_is_not_retried() {
  use std::sync::atomic::{AtomicUsize, Ordering};

  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-noretry").await;

  let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin_listener.local_addr().unwrap();
  let requests_seen = Arc::new(AtomicUsize::new(0));
  let counter = requests_seen.clone();
  // answers the first request properly, every later one with garbage
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = origin_listener.accept().await.unwrap();
      let counter = counter.clone();
      tokio::spawn(async move {
        loop {
          let mut buf = Vec::new();
          let mut byte = [0u8; 1];
          while !buf.ends_with(b"\r\n\r\n") {
            match stream.read(&mut byte).await {
              Ok(0) | Err(_) => return,
              Ok(_) => buf.push(byte[0]),
            }
          }
          let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
          let reply: &[u8] = if n == 1 {
            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"
          } else {
            b"GARBAGE\r\n\r\n"
          };
          let _ = stream.write_all(reply).await;
          let _ = stream.flush().await;
        }
      });
    }
  });

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    origin_addr, origin_addr
  );

  client.write_all(request.as_bytes()).await.unwrap();
  let first = read_one_response(&mut client).await;
  assert!(first.starts_with("HTTP/1.1 200"), "first response: {}", first);

  // the second exchange reuses the pooled connection and gets an
  // unparseable reply; that must surface as 502, never as a resend
  client.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  client.read_to_end(&mut raw).await.unwrap();
  let second = String::from_utf8_lossy(&raw);
  assert!(
    second.starts_with("HTTP/1.1 502"),
    "expected 502, got: {}",
    second
  );
  assert_eq!(requests_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_upstream_yields_bad_gateway() {
  let (proxy_addr, _proxy) = start_proxy("interpose-test-e2e-502").await;

  // a port nothing listens on
  let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_addr = dead.local_addr().unwrap();
  drop(dead);

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://{}/ HTTP/1.1\r\nHost: {}\r\n\r\n",
    dead_addr, dead_addr
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let mut raw = Vec::new();
  client.read_to_end(&mut raw).await.unwrap();
  let response = String::from_utf8_lossy(&raw);
  assert!(
    response.starts_with("HTTP/1.1 502"),
    "expected 502, got: {}",
    response
  );
}
