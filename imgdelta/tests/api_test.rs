use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use opentelemetry::metrics::MeterProvider;

use imgdelta::api::models::{DeltaResponse, ErrorResponse};
use imgdelta::api::routes::AppMetrics;
use imgdelta::engine::{DeltaEngine, EngineConfig};
use imgdelta::registry::MemoryRegistry;
use ociclient::ImageReference;

struct TestServer {
    handle: JoinHandle<()>,
    port: u16,
    engine: Arc<DeltaEngine>,
    registry: Arc<MemoryRegistry>,
    v1: ImageReference,
}

impl TestServer {
    fn url(&self) -> String {
        format!("http://localhost:{}/v1/delta", self.port)
    }

    async fn get(&self, params: &[(&str, &str)]) -> reqwest::Response {
        reqwest::Client::new().get(self.url()).query(params).send().await.unwrap()
    }
}

// Helper function to start the delta server for testing
async fn start_test_server() -> TestServer {
    // Use a random available port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let registry = Arc::new(MemoryRegistry::new());
    let old: Vec<u8> = (0..16_384u32).map(|i| (i % 253) as u8).collect();
    let mut new = old.clone();
    new[4096..4100].copy_from_slice(b"beef");

    let v1 = registry.put_artifact(&"registry.example.com/app:v1".parse().unwrap(), "application/octet-stream", &old, false);
    registry.put_artifact(&"registry.example.com/app:v2".parse().unwrap(), "application/octet-stream", &new, false);

    // Create metrics for testing
    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    let app_metrics = Arc::new(AppMetrics {
        request_counter: meter.u64_counter("test_requests").init(),
    });
    let engine = Arc::new(DeltaEngine::new(registry.clone(), EngineConfig::default(), &meter));

    // Create application state
    let app_state = (Arc::clone(&engine), Arc::clone(&app_metrics));

    // Build application
    let app = axum::Router::new()
        .merge(imgdelta::api::routes::delta_router(app_state))
        .with_state((Arc::clone(&engine), app_metrics));

    // Start server in a separate task
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    sleep(Duration::from_millis(100)).await;

    TestServer { handle, port, engine, registry, v1 }
}

#[tokio::test]
async fn test_delta_lifecycle() {
    let server = start_test_server().await;
    let from = server.v1.to_string();
    let params = [("from", from.as_str()), ("to", "registry.example.com/app:v2"), ("accept", "bsdiff, zstd")];

    let response = server.get(&params).await;
    assert_eq!(response.status().as_u16(), 202);

    server.engine.wait_for_idle().await;

    let response = server.get(&params).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: DeltaResponse = response.json().await.unwrap();

    let target: ImageReference = body.target_image.parse().unwrap();
    assert_eq!(target.name, "app");
    assert!(target.is_digest());

    let delta: ImageReference = body.delta_image.parse().unwrap();
    assert!(delta.name.starts_with("deltas/"));
    assert!(delta.is_digest());
    let manifest = server.registry.manifest(&delta).unwrap();
    assert_eq!(manifest.layers[0].media_type, "application/bsdiff+zstd");

    server.handle.abort();
}

#[tokio::test]
async fn test_response_uses_camel_case() {
    let server = start_test_server().await;
    let from = server.v1.to_string();
    let params = [("from", from.as_str()), ("to", "registry.example.com/app:v2")];

    server.get(&params).await;
    server.engine.wait_for_idle().await;

    let body: serde_json::Value = server.get(&params).await.json().await.unwrap();
    assert!(body["targetImage"].is_string());
    assert!(body["deltaImage"].is_string());

    server.handle.abort();
}

#[tokio::test]
async fn test_from_tag_is_bad_request() {
    let server = start_test_server().await;

    let response = server
        .get(&[("from", "registry.example.com/app:v1"), ("to", "registry.example.com/app:v2")])
        .await;
    assert_eq!(response.status().as_u16(), 400);

    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.errors.len(), 1);
    assert_eq!(body.errors[0].code, "BAD_REQUEST");

    server.handle.abort();
}

#[tokio::test]
async fn test_missing_parameters() {
    let server = start_test_server().await;

    let response = server.get(&[("to", "registry.example.com/app:v2")]).await;
    assert_eq!(response.status().as_u16(), 400);

    server.handle.abort();
}

#[tokio::test]
async fn test_same_version_is_no_content() {
    let server = start_test_server().await;
    let from = server.v1.to_string();

    let response = server.get(&[("from", from.as_str()), ("to", "registry.example.com/app:v1")]).await;
    assert_eq!(response.status().as_u16(), 204);
    assert!(server.registry.manifest_pushes().is_empty());

    server.handle.abort();
}

#[tokio::test]
async fn test_unknown_alias_is_not_found() {
    let server = start_test_server().await;
    let from = server.v1.to_string();

    let response = server.get(&[("from", from.as_str()), ("to", "registry.example.com/app:v3")]).await;
    assert_eq!(response.status().as_u16(), 404);

    let body: ErrorResponse = response.json().await.unwrap();
    assert_eq!(body.errors[0].code, "ALIAS_NOT_FOUND");

    server.handle.abort();
}

#[tokio::test]
async fn test_unauthorized_repository() {
    let server = start_test_server().await;
    server.registry.set_unauthorized(&server.v1);
    let from = server.v1.to_string();

    let response = server.get(&[("from", from.as_str()), ("to", "registry.example.com/app:v2")]).await;
    assert_eq!(response.status().as_u16(), 401);

    server.handle.abort();
}

#[tokio::test]
async fn test_health_check() {
    let server = start_test_server().await;

    let response = reqwest::get(format!("http://localhost:{}/healthz", server.port)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["computations"], 0);

    server.handle.abort();
}
