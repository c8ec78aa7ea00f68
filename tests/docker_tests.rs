//! Tests for the deployment client and compose generation.

mod common;

use common::*;
use std::collections::BTreeMap;
use std::time::Duration;
use wasmhive::docker::{backend_command, generate_compose};
use wasmhive::{DeploymentRequest, DockerClient, Error, HttpDockerClient, RuntimeBackend};

fn request(id: &str, backend: RuntimeBackend) -> DeploymentRequest {
    DeploymentRequest {
        container_id: id.to_string(),
        name: "counter".to_string(),
        version: "1.0.0".to_string(),
        image: DeploymentRequest::image_for("counter", "1.0.0"),
        backend,
        environment: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
        memory_limit: 16 * 1024 * 1024,
        module_digest: "ab".repeat(32),
    }
}

// =============================================================================
// HTTP Client Tests
// =============================================================================

#[tokio::test]
async fn test_create_and_start() {
    let responder = HttpResponder::start(200, r#"{"id":"abc123"}"#).await;
    let client = HttpDockerClient::new(&responder.url, Duration::from_secs(5)).unwrap();

    let created = client
        .create(&request("counter-1", RuntimeBackend::Host))
        .await
        .unwrap();
    let started = client.start(&created).await.unwrap();

    assert_eq!(created, "abc123");
    assert_eq!(started, "abc123");

    let requests = responder.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/docker/create");
    assert_eq!(requests[1].path, "/docker/start");

    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["containerId"], "counter-1");
    assert_eq!(body["image"], "wasmhive/counter:1.0.0");
    assert_eq!(body["environment"]["MODE"], "prod");

    let body: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(body["id"], "abc123");
}

#[tokio::test]
async fn test_plain_text_id() {
    let responder = HttpResponder::start(200, "plain-id\n").await;
    let client = HttpDockerClient::new(&responder.url, Duration::from_secs(5)).unwrap();

    let id = client.start("whatever").await.unwrap();
    assert_eq!(id, "plain-id");
}

#[tokio::test]
async fn test_server_error() {
    let responder = HttpResponder::start(500, "daemon exploded").await;
    let client = HttpDockerClient::new(&responder.url, Duration::from_secs(5)).unwrap();

    let err = client
        .create(&request("counter-1", RuntimeBackend::Host))
        .await
        .unwrap_err();
    match err {
        Error::DeploymentFailed { id, reason } => {
            assert_eq!(id, "counter-1");
            assert!(reason.contains("500"));
            assert!(reason.contains("daemon exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_empty_id_is_rejected() {
    let responder = HttpResponder::start(200, "").await;
    let client = HttpDockerClient::new(&responder.url, Duration::from_secs(5)).unwrap();

    let err = client.start("x").await.unwrap_err();
    assert!(matches!(err, Error::DeploymentFailed { .. }));
}

#[tokio::test]
async fn test_deploy_timeout() {
    let responder =
        HttpResponder::start_with_delay(200, r#"{"id":"late"}"#, Duration::from_millis(500)).await;
    let client = HttpDockerClient::new(&responder.url, Duration::from_millis(50)).unwrap();

    let err = client.start("x").await.unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_endpoint_trailing_slash() {
    let client = HttpDockerClient::new("http://deploy:9000/", Duration::from_secs(1)).unwrap();
    assert_eq!(client.endpoint(), "http://deploy:9000");
}

// =============================================================================
// Compose Tests
// =============================================================================

#[test]
fn test_compose_document() {
    let compose = generate_compose(&[
        request("counter-1", RuntimeBackend::Host),
        request("counter-2", RuntimeBackend::Wasm3),
    ])
    .unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&compose).unwrap();

    assert_eq!(doc["version"].as_str(), Some("3.8"));

    let first = &doc["services"]["counter-1"];
    assert_eq!(first["image"].as_str(), Some("wasmhive/counter:1.0.0"));
    assert_eq!(first["command"][0].as_str(), Some("wasmtime"));
    assert_eq!(first["environment"]["MODE"].as_str(), Some("prod"));
    assert_eq!(first["deploy"]["resources"]["limits"]["memory"].as_str(), Some("16m"));
    assert_eq!(first["labels"]["wasmhive.id"].as_str(), Some("counter-1"));
    assert_eq!(
        first["labels"]["wasmhive.module.digest"].as_str(),
        Some("ab".repeat(32).as_str())
    );

    let second = &doc["services"]["counter-2"];
    assert_eq!(second["command"][0].as_str(), Some("wasm3"));
    assert_eq!(second["labels"]["wasmhive.backend"].as_str(), Some("wasm3"));
}

#[test]
fn test_compose_without_containers() {
    let compose = generate_compose(&[]).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&compose).unwrap();
    assert!(doc["services"].as_mapping().is_some_and(|m| m.is_empty()));
}

#[test]
fn test_backend_commands() {
    assert_eq!(
        backend_command(RuntimeBackend::Wasmer),
        vec!["wasmer", "run", "/app/module.wasm"]
    );
    assert_eq!(backend_command(RuntimeBackend::Wasmtime)[0], "wasmtime");
}
