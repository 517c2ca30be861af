//! Kernel-level workflow tests against a mocked engine.

use nplbridge_kernel::{BridgeKernel, InstanceQuery};
use nplbridge_types::config::{AuthConfig, BridgeConfig};
use nplbridge_types::tool::ToolCall;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(uri: &str) -> BridgeConfig {
    BridgeConfig {
        engine_url: uri.to_string(),
        packages: vec!["commerce".to_string()],
        package_files: Vec::new(),
        auth: AuthConfig::Token {
            token: "static-token".to_string(),
        },
        ..Default::default()
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
            "/npl/commerce/Product/{id}/publish": {"post": {
                "summary": "Publish product"
            }}
        }
    })
}

async fn mount_spec(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/npl/commerce/-/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(commerce_spec()))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_then_act_tracks_memory() {
    let server = MockServer::start().await;
    mount_spec(&server).await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/"))
        .and(header("Authorization", "Bearer static-token"))
        .and(body_json(json!({"name": "Pump", "price": 1200})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"@id": "p-1", "@state": "draft", "name": "Pump"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/npl/commerce/Product/p-1/publish"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"@state": "published"})))
        .expect(1)
        .mount(&server)
        .await;

    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    let cancel = CancellationToken::new();

    let defs = kernel.tool_definitions(None, &cancel).await.unwrap();
    let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    assert!(names.contains(&"commerce_Product_create"));
    assert!(names.contains(&"commerce_Product_publish"));
    assert!(names.contains(&"get_protocol_id"));

    let created = kernel
        .invoke_tool(
            "seller1",
            "commerce_Product_create",
            &json!({"name": "Pump", "price": 1200}),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(created["@id"], "p-1");
    assert_eq!(kernel.memory().most_recent("seller1", "Product").unwrap(), "p-1");

    // The agent looks the id up instead of carrying it.
    let lookup = kernel
        .invoke_tool("seller1", "get_protocol_id", &json!({"protocol_type": "Product"}), &cancel)
        .await
        .unwrap();
    let id = lookup["instance_id"].as_str().unwrap().to_string();

    kernel
        .invoke_tool(
            "seller1",
            "commerce_Product_publish",
            &json!({"instance_id": id}),
            &cancel,
        )
        .await
        .unwrap();

    let latest = kernel.memory().latest("seller1", "Product").unwrap();
    assert_eq!(latest.state.as_deref(), Some("published"));
    assert_eq!(latest.role.as_deref(), Some("owner"));
}

#[tokio::test]
async fn test_execute_call_reports_validation_failure() {
    let server = MockServer::start().await;
    mount_spec(&server).await;

    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    let call = ToolCall {
        id: "call-7".to_string(),
        name: "commerce_Product_create".to_string(),
        input: json!({"name": "Pump"}),
    };
    let result = kernel
        .execute_call("seller1", &call, &CancellationToken::new())
        .await;
    assert!(result.is_error);
    let failure: Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(failure["kind"], "invalid_argument");
    assert_eq!(failure["retryable"], false);
    assert_eq!(kernel.memory().len("seller1"), 0);
}

#[tokio::test]
async fn test_unknown_tool_is_not_found() {
    let server = MockServer::start().await;
    mount_spec(&server).await;

    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    let err = kernel
        .invoke_tool("seller1", "commerce_Order_create", &json!({}), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown tool"));
}

#[tokio::test]
async fn test_handoff_between_agents() {
    let server = MockServer::start().await;
    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    kernel
        .memory()
        .remember("buyer1", "PurchaseOrder", "po-9", Some("sent"), Some("owner"));

    let record = kernel
        .handoff("buyer1", "supplier1", "PurchaseOrder", None)
        .unwrap();
    assert_eq!(record.agent_identity, "supplier1");
    assert_eq!(
        kernel.memory().most_recent("supplier1", "PurchaseOrder").unwrap(),
        "po-9"
    );
    assert!(kernel.handoff("nobody", "supplier1", "Offer", None).is_err());
}

#[tokio::test]
async fn test_unparseable_package_is_skipped() {
    let server = MockServer::start().await;
    mount_spec(&server).await;
    Mock::given(method("GET"))
        .and(path("/npl/broken/-/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a spec</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(&server.uri());
    cfg.packages = vec!["broken".to_string(), "commerce".to_string()];
    let kernel = BridgeKernel::boot(cfg).unwrap();

    let tools = kernel
        .list_compiled_tools(None, &CancellationToken::new())
        .await
        .unwrap();
    let mut names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
    names.sort();
    assert_eq!(names, vec!["commerce_Product_create", "commerce_Product_publish"]);
}

#[tokio::test]
async fn test_get_instance_records_observed_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/npl/commerce/Product/p-1/"))
        .and(header("Authorization", "Bearer static-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"@id": "p-1", "@state": "published", "price": 900})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    kernel
        .memory()
        .remember("seller1", "Product", "p-1", Some("draft"), Some("owner"));

    let instance = kernel
        .get_instance("seller1", "commerce", "Product", "p-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(instance["price"], 900);

    let latest = kernel.memory().latest("seller1", "Product").unwrap();
    assert_eq!(latest.state.as_deref(), Some("published"));
    assert_eq!(latest.role.as_deref(), Some("owner"));
    assert_eq!(kernel.memory().len("seller1"), 2);
}

#[tokio::test]
async fn test_query_instances_pages_and_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/npl/commerce/Product/"))
        .and(query_param("page", "1"))
        .and(query_param("size", "2"))
        .and(query_param("brand", "Acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"@id": "p-3", "@state": "draft"},
                {"@id": "p-4", "@state": "published"}
            ],
            "page": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let kernel = BridgeKernel::boot(config(&server.uri())).unwrap();
    let query = InstanceQuery::default().page(1).size(2).filter("brand", "Acme");
    let page = kernel
        .query_instances("buyer1", "commerce", "Product", &query, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 2);

    let history = kernel.memory().history("buyer1", Some("Product"));
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.role.as_deref() == Some("participant")));
    assert_eq!(kernel.memory().most_recent("buyer1", "Product").unwrap(), "p-4");
}
