//! Discovery-path scenarios: OpenAPI fetch + normalization feeding the
//! inventory reconciler.

use serde_json::json;
use toolgate::domain::{AuthMode, SourceAggregate, SourceType};
use toolgate::sources::{InventoryReconciler, OpenApiSourceAdapter, SourceAdapter};
use toolgate::storage::{InMemorySourceRepository, InMemoryToolRepository, SourceRepository, ToolRepository};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn users_spec(server_uri: &str) -> serde_json::Value {
    json!({
        "openapi": "3.0.3",
        "info": {"title": "Users API", "version": "2.0.1"},
        "servers": [{"url": server_uri}],
        "paths": {
            "/users": {
                "get": {
                    "operationId": "listUsers",
                    "parameters": [
                        {"name": "limit", "in": "query", "required": true,
                         "schema": {"type": "integer"}},
                        {"name": "q", "in": "query", "required": false,
                         "schema": {"type": "string"}}
                    ]
                }
            }
        }
    })
}

async fn registered_source(sources: &InMemorySourceRepository, spec_url: String) {
    let (mut source, _) = SourceAggregate::register(
        "users",
        "Users API",
        spec_url.clone(),
        SourceType::Openapi,
        AuthMode::None,
        chrono::Utc::now(),
    );
    source.spec_url = Some(spec_url);
    sources.add(source).await.unwrap();
}

#[tokio::test]
async fn fetches_and_normalizes_the_spec_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_spec(&server.uri())))
        .mount(&server)
        .await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let result = adapter
        .fetch_and_normalize(&format!("{}/openapi.json", server.uri()), None, None, None)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.source_version.as_deref(), Some("2.0.1"));
    let tool = &result.tools[0];
    assert_eq!(tool.name, "listUsers");
    assert_eq!(
        tool.execution_profile.url_template,
        format!(
            "{}/users?limit={{{{ limit }}}}{{% if q is defined %}}&q={{{{ q }}}}{{% endif %}}",
            server.uri()
        )
    );
}

#[tokio::test]
async fn yaml_specs_are_accepted() {
    let server = MockServer::start().await;
    let yaml = format!(
        "openapi: \"3.1.0\"\ninfo:\n  title: Ping\n  version: \"1.0\"\nservers:\n  - url: {}\npaths:\n  /ping:\n    get:\n      operationId: ping\n",
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/openapi.yaml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/yaml")
                .set_body_string(yaml),
        )
        .mount(&server)
        .await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let result = adapter
        .fetch_and_normalize(&format!("{}/openapi.yaml", server.uri()), None, None, None)
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.tools[0].name, "ping");
}

#[tokio::test]
async fn swagger_two_fails_with_a_specific_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "swagger": "2.0",
            "info": {"title": "Old", "version": "1"},
            "paths": {}
        })))
        .mount(&server)
        .await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let result = adapter
        .fetch_and_normalize(&format!("{}/swagger.json", server.uri()), None, None, None)
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Swagger 2.0"));
    assert!(
        !adapter
            .validate_url(&format!("{}/swagger.json", server.uri()), None)
            .await
    );
}

#[tokio::test]
async fn back_to_back_refreshes_are_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users_spec(&server.uri())))
        .mount(&server)
        .await;

    let sources = InMemorySourceRepository::new();
    let tools = InMemoryToolRepository::new();
    let spec_url = format!("{}/openapi.json", server.uri());
    registered_source(&sources, spec_url.clone()).await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let reconciler = InventoryReconciler::new(sources.clone(), tools.clone());

    let first_ingestion = adapter.fetch_and_normalize(&spec_url, None, None, None).await;
    let (first, _) = reconciler.reconcile("users", &first_ingestion, false).await.unwrap();
    assert_eq!(first.tools_created, 1);

    let second_ingestion = adapter.fetch_and_normalize(&spec_url, None, None, None).await;
    let (second, _) = reconciler.reconcile("users", &second_ingestion, false).await.unwrap();
    assert_eq!(second.tools_created, 0);
    assert_eq!(second.tools_updated, 0);
    assert_eq!(second.tools_deprecated, 0);
    assert_eq!(second.inventory_hash, first.inventory_hash);
    assert!(second.skipped);

    // Aggregate key invariant: id == source_id:name.
    for aggregate in tools.list_by_source("users").await.unwrap() {
        assert_eq!(
            aggregate.id,
            format!("{}:{}", aggregate.source_id, aggregate.definition.name)
        );
    }
}

#[tokio::test]
async fn upstream_drift_deprecates_missing_operations() {
    let server = MockServer::start().await;
    let full = users_spec(&server.uri());
    let mut reduced = full.clone();
    reduced["paths"]["/users"]["get"]["operationId"] = json!("listUsersV2");

    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(full))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reduced))
        .mount(&server)
        .await;

    let sources = InMemorySourceRepository::new();
    let tools = InMemoryToolRepository::new();
    let spec_url = format!("{}/openapi.json", server.uri());
    registered_source(&sources, spec_url.clone()).await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let reconciler = InventoryReconciler::new(sources.clone(), tools.clone());

    let ingestion = adapter.fetch_and_normalize(&spec_url, None, None, None).await;
    reconciler.reconcile("users", &ingestion, false).await.unwrap();

    let ingestion = adapter.fetch_and_normalize(&spec_url, None, None, None).await;
    let (outcome, _) = reconciler.reconcile("users", &ingestion, false).await.unwrap();
    assert_eq!(outcome.tools_created, 1);
    assert_eq!(outcome.tools_deprecated, 1);

    let old = tools.get("users:listUsers").await.unwrap().unwrap();
    assert_eq!(old.status, toolgate::domain::ToolStatus::Deprecated);
}

#[tokio::test]
async fn fetch_failure_only_records_source_bookkeeping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let sources = InMemorySourceRepository::new();
    let tools = InMemoryToolRepository::new();
    let spec_url = format!("{}/openapi.json", server.uri());
    registered_source(&sources, spec_url.clone()).await;

    let adapter = OpenApiSourceAdapter::new(reqwest::Client::new(), 10);
    let reconciler = InventoryReconciler::new(sources.clone(), tools.clone());

    let ingestion = adapter.fetch_and_normalize(&spec_url, None, None, None).await;
    assert!(!ingestion.success);
    reconciler.reconcile("users", &ingestion, false).await.unwrap();

    let source = sources.get("users").await.unwrap().unwrap();
    assert_eq!(source.consecutive_failures, 1);
    assert!(source.last_sync_error.is_some());
}
