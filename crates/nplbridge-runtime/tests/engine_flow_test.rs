//! End-to-end tests for discovery, compilation, caching and invocation.
//!
//! A wiremock server plays both the protocol engine and the Keycloak
//! token endpoint; requests go through the real reqwest backend.

use nplbridge_runtime::auth::provider_from_config;
use nplbridge_runtime::compiler::ToolCompiler;
use nplbridge_runtime::credentials::CredentialManager;
use nplbridge_runtime::discovery::PackageDiscovery;
use nplbridge_runtime::http::{HttpBackend, ReqwestBackend};
use nplbridge_runtime::metrics::{MetricsCollector, METRIC_CALLS};
use nplbridge_runtime::retry::RetryConfig;
use nplbridge_runtime::tool_cache::{SpecToolSource, ToolCache};
use nplbridge_runtime::transport::ResilientTransport;
use nplbridge_types::config::{AuthConfig, BridgeConfig};
use nplbridge_types::error::BridgeError;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Stack {
    discovery: Arc<PackageDiscovery>,
    cache: ToolCache,
    metrics: Arc<MetricsCollector>,
}

fn config(uri: &str) -> BridgeConfig {
    BridgeConfig {
        engine_url: uri.to_string(),
        package_files: Vec::new(),
        auth: AuthConfig::Keycloak {
            url: Some(uri.to_string()),
            realm: None,
            client_id: "npl-client".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            host_header: None,
        },
        ..Default::default()
    }
}

fn stack(config: &BridgeConfig) -> Stack {
    let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new().unwrap());
    let provider = provider_from_config(config, backend.clone()).unwrap();
    let credentials = Arc::new(CredentialManager::new(provider, config.refresh_margin_secs));
    let metrics = Arc::new(MetricsCollector::new());
    let retry = RetryConfig {
        max_attempts: 3,
        min_delay_ms: 1,
        max_delay_ms: 5,
        max_total_wait_ms: 100,
        jitter: 0.0,
    };
    let transport = Arc::new(
        ResilientTransport::new(backend, credentials.clone(), retry, Duration::from_secs(5))
            .with_sink(metrics.clone()),
    );
    let discovery = Arc::new(PackageDiscovery::new(transport.clone(), config));
    let source = Arc::new(SpecToolSource::new(
        discovery.clone(),
        ToolCompiler::new(&config.name_separator),
        transport,
    ));
    let cache = ToolCache::new(source, credentials, Duration::from_secs(60));
    Stack {
        discovery,
        cache,
        metrics,
    }
}

fn commerce_spec() -> Value {
    json!({
        "openapi": "3.0.1",
        "info": {"title": "commerce", "version": "1.0"},
        "paths": {
            "/npl/commerce/Product/": {"post": {
                "summary": "Create Product",
                "requestBody": {"content": {"application/json": {"schema": {
                    "type": "object",
                    "required": ["name", "price"],
                    "properties": {
                        "name": {"type": "string"},
                        "price": {"type": "number"},
                        "brand": {"type": "string"}
                    }
                }}}}
            }},
            "/npl/commerce/Product/{id}/approve": {"post": {
                "summary": "Approve product"
            }},
            "/npl/commerce/Product/{id}/": {"get": {}}
        }
    })
}

async fn mount_keycloak(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/realms/poc/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 300
        })))
        .mount(server)
        .await;
}

async fn mount_engine(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/swagger-ui/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><script>window.ui = SwaggerUIBundle({urls: [{"url": "/npl/commerce/-/openapi.json"}]})</script></html>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/npl/commerce/-/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commerce_spec()))
        .expect(1)
        .mount(server)
        .await;
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_discover_compile_and_create() {
    let server = MockServer::start().await;
    mount_keycloak(&server).await;
    mount_engine(&server).await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/"))
        .and(header("Authorization", "Bearer at-1"))
        .and(body_json(json!({"name": "Pump", "price": 1200})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"@id": "p-1", "@state": "draft"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack(&config(&server.uri()));
    let cancel = CancellationToken::new();

    let packages = stack.discovery.list_packages(None, &cancel).await.unwrap();
    assert_eq!(packages, vec!["commerce"]);

    let tools = stack.cache.get_tools("commerce", false, &cancel).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["commerce_Product_create", "commerce_Product_approve"]);

    let create = &tools[0];
    let params: Vec<(&str, bool)> = create
        .parameters()
        .iter()
        .map(|p| (p.flattened_name.as_str(), p.required))
        .collect();
    assert_eq!(params, vec![("name", true), ("price", true), ("brand", false)]);

    let result = create
        .invoke(&args(json!({"name": "Pump", "price": 1200})), &cancel)
        .await
        .unwrap();
    assert_eq!(result["@id"], json!("p-1"));

    // Second lookup is served from the cache (spec mock expects one fetch).
    stack.cache.get_tools("commerce", false, &cancel).await.unwrap();
    assert!(
        stack
            .metrics
            .counter(METRIC_CALLS, &[("operation", "commerce/Product.create"), ("outcome", "success")])
            >= 1
    );
}

#[tokio::test]
async fn test_unauthorized_action_refreshes_once() {
    let server = MockServer::start().await;
    mount_keycloak(&server).await;
    mount_engine(&server).await;
    Mock::given(method("POST"))
        .and(path("/realms/poc/protocol/openid-connect/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-2",
            "refresh_token": "rt-2",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/p-1/approve"))
        .and(header("Authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/p-1/approve"))
        .and(header("Authorization", "Bearer at-2"))
        .and(header("X-Party", "seller"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack(&config(&server.uri()));
    let cancel = CancellationToken::new();
    let tools = stack.cache.get_tools("commerce", false, &cancel).await.unwrap();
    let approve = tools
        .iter()
        .find(|t| t.name() == "commerce_Product_approve")
        .unwrap();

    let result = approve
        .invoke(&args(json!({"instance_id": "p-1", "party": "seller"})), &cancel)
        .await
        .unwrap();
    assert_eq!(result, json!({}));
}

#[tokio::test]
async fn test_business_rejection_is_not_retried() {
    let server = MockServer::start().await;
    mount_keycloak(&server).await;
    mount_engine(&server).await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/p-1/approve"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"message": "Illegal protocol state"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack(&config(&server.uri()));
    let cancel = CancellationToken::new();
    let tools = stack.cache.get_tools("commerce", false, &cancel).await.unwrap();
    let err = tools[1]
        .invoke(&args(json!({"instance_id": "p-1"})), &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::BusinessRejected {
            status: 400,
            message: "Illegal protocol state".to_string()
        }
    );
}

#[tokio::test]
async fn test_engine_outage_exhausts_retries() {
    let server = MockServer::start().await;
    mount_keycloak(&server).await;
    mount_engine(&server).await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let stack = stack(&config(&server.uri()));
    let cancel = CancellationToken::new();
    let tools = stack.cache.get_tools("commerce", false, &cancel).await.unwrap();
    let err = tools[0]
        .invoke(&args(json!({"name": "Pump", "price": 1})), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::TransientExhausted {
            status: Some(503),
            attempts: 3,
            ..
        }
    ));
    assert!(err.is_retryable());
}
