//! Integration tests for the certificate authority and hook registry

use interpose::{CertificateStore, HookRegistry, LogHook};
use std::sync::Arc;

#[tokio::test]
async fn test_ca_generation() {
  let temp_dir = std::env::temp_dir().join("interpose-test-ca");

  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertificateStore::new(&temp_dir).await;
  assert!(store.is_ok(), "Failed to create certificate store");

  let store = store.unwrap();

  let ca_pem = store.root_cert_pem();
  assert!(ca_pem.is_ok(), "Failed to get CA certificate PEM");

  let pem_content = ca_pem.unwrap();
  assert!(
    pem_content.contains("BEGIN CERTIFICATE"),
    "Invalid PEM format"
  );
  assert!(
    pem_content.contains("END CERTIFICATE"),
    "Invalid PEM format"
  );

  assert!(
    store.root_cert_path().exists(),
    "CA certificate file not created"
  );

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_ca_persists_across_restarts() {
  let temp_dir = std::env::temp_dir().join("interpose-test-ca-reload");

  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let first = CertificateStore::new(&temp_dir).await.unwrap();
  let first_pem = first.root_cert_pem().unwrap();
  drop(first);

  // a second store over the same path must load the same root
  let second = CertificateStore::new(&temp_dir).await.unwrap();
  let second_pem = second.root_cert_pem().unwrap();
  assert_eq!(first_pem, second_pem, "CA root changed across restarts");

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_leaf_generation() {
  let temp_dir = std::env::temp_dir().join("interpose-test-leaf");

  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertificateStore::new(&temp_dir).await.unwrap();

  let result = store.leaf_for("example.com").await;
  assert!(result.is_ok(), "Failed to generate leaf certificate");

  let (cert_chain, _key) = result.unwrap();
  assert_eq!(
    cert_chain.len(),
    2,
    "Expected 2 certificates in chain (leaf + root)"
  );

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_leaf_caching_and_tls_config() {
  use tokio_rustls::rustls::ServerConfig;

  let temp_dir = std::env::temp_dir().join("interpose-test-leaf-caching");

  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertificateStore::new(&temp_dir).await.unwrap();

  // first request mints and caches, later requests hit the cache; each
  // returned chain/key pair must stay consistent or rustls rejects it
  for attempt in 0..3 {
    let (chain, key) = store.leaf_for("test.example.com").await.unwrap();
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key);
    assert!(
      config.is_ok(),
      "TLS config failed on attempt {}: {:?}",
      attempt,
      config.err()
    );
  }

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_leaf_for_ip_literal() {
  let temp_dir = std::env::temp_dir().join("interpose-test-leaf-ip");

  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertificateStore::new(&temp_dir).await.unwrap();
  let result = store.leaf_for("127.0.0.1").await;
  assert!(result.is_ok(), "Failed to mint a leaf for an IP literal");

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_hook_registry_with_log_hook() {
  use bytes::Bytes;
  use interpose::{Flow, Request};

  let mut registry = HookRegistry::new();
  registry.add_request_hook(Arc::new(LogHook));
  registry.add_response_hook(Arc::new(LogHook));

  let request: Request = http::Request::builder()
    .method("GET")
    .uri("http://example.com/")
    .header(http::header::HOST, "example.com")
    .body(Bytes::new())
    .unwrap()
    .into();

  let mut flow = Flow::new(
    "127.0.0.1:7000".parse().unwrap(),
    ("example.com".to_string(), 80),
    request,
  );

  registry.fire_request(&mut flow).await;
  assert_eq!(
    flow.request().method(),
    &http::Method::GET,
    "Logging must not mutate the request"
  );
}
