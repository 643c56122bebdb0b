//! Command-bus round trips: register a source, refresh its inventory, and
//! execute a discovered tool through the full dispatch path.

use serde_json::{Map, json};
use std::sync::Arc;
use toolgate::auth::{ClientCredentialsService, TokenExchanger};
use toolgate::breaker::CircuitBreakerRegistry;
use toolgate::builtins::BuiltinRegistry;
use toolgate::bus::commands::{
    CleanupOrphanedTools, DeleteSource, DisableTool, ExecuteTool, RefreshInventory, RegisterSource,
    ResetCircuitBreaker,
};
use toolgate::bus::handlers::{AdapterSet, GatewayService};
use toolgate::bus::{CommandBus, OperationResult};
use toolgate::config::{
    BuiltinSettings, CircuitBreakerSettings, ExecutorSettings, IdpSettings, TokenCacheSettings,
};
use toolgate::domain::{AuthMode, SourceType, ToolStatus};
use toolgate::executor::{ExecutionStatus, ToolExecutor};
use toolgate::sources::{
    BuiltinSourceAdapter, InventoryReconciler, McpSourceAdapter, OpenApiSourceAdapter,
};
use toolgate::storage::{
    InMemorySourceRepository, InMemoryToolRepository, SourceRepository, StaticSecretsStore,
    ToolRepository,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Gateway {
    bus: CommandBus,
    tools: Arc<InMemoryToolRepository>,
    sources: Arc<InMemorySourceRepository>,
}

fn gateway() -> Gateway {
    let http = reqwest::Client::new();
    let sources = InMemorySourceRepository::new();
    let tools = InMemoryToolRepository::new();
    let breakers = CircuitBreakerRegistry::new(CircuitBreakerSettings::default());
    let builtins = BuiltinRegistry::standard(&BuiltinSettings::default());
    let mcp = Arc::new(McpSourceAdapter::new());
    let idp = IdpSettings::default();

    let executor = Arc::new(ToolExecutor::new(
        ExecutorSettings::default(),
        Arc::new(TokenExchanger::new(
            http.clone(),
            idp.clone(),
            TokenCacheSettings::default(),
            breakers.clone(),
        )),
        Arc::new(ClientCredentialsService::new(
            http.clone(),
            idp,
            TokenCacheSettings::default(),
        )),
        breakers.clone(),
        builtins.clone(),
        mcp.clone(),
    ));

    let service = Arc::new(GatewayService {
        sources: sources.clone(),
        tools: tools.clone(),
        secrets: StaticSecretsStore::empty(),
        adapters: Arc::new(AdapterSet {
            openapi: Arc::new(OpenApiSourceAdapter::new(http, 10)),
            mcp,
            builtin: Arc::new(BuiltinSourceAdapter::new(builtins)),
        }),
        reconciler: Arc::new(InventoryReconciler::new(sources.clone(), tools.clone())),
        executor,
        breakers,
    });

    Gateway {
        bus: service.into_bus(),
        tools,
        sources,
    }
}

fn orders_spec(server_uri: &str) -> serde_json::Value {
    json!({
        "openapi": "3.0.0",
        "info": {"title": "Orders", "version": "1.0"},
        "servers": [{"url": server_uri}],
        "paths": {
            "/orders/{id}": {
                "get": {
                    "operationId": "get_order",
                    "parameters": [
                        {"name": "id", "in": "path", "required": true,
                         "schema": {"type": "string"}}
                    ]
                }
            }
        }
    })
}

async fn register_and_refresh(gateway: &Gateway, server: &MockServer) {
    let registered = gateway
        .bus
        .execute(RegisterSource {
            id: "orders".into(),
            name: "Orders API".into(),
            url: server.uri(),
            spec_url: Some(format!("{}/openapi.json", server.uri())),
            source_type: SourceType::Openapi,
            auth_mode: AuthMode::None,
            default_audience: None,
            required_scopes: Vec::new(),
            mcp_config: None,
            validate: false,
        })
        .await;
    assert!(registered.is_ok());

    let refreshed = gateway
        .bus
        .execute(RefreshInventory {
            source_id: "orders".into(),
            force: false,
        })
        .await;
    let outcome = refreshed.into_data().unwrap();
    assert_eq!(outcome.tools_created, 1);
}

#[tokio::test]
async fn register_refresh_execute_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(orders_spec(&server.uri())))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42", "total": 31.5})))
        .mount(&server)
        .await;

    let gateway = gateway();
    register_and_refresh(&gateway, &server).await;

    let mut arguments = Map::new();
    arguments.insert("id".into(), json!("42"));
    let executed = gateway
        .bus
        .execute(ExecuteTool {
            tool_id: "orders:get_order".into(),
            arguments,
            agent_token: String::new(),
            validate_schema: None,
        })
        .await;
    let result = executed.into_data().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    assert_eq!(result.result.unwrap()["total"], 31.5);
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(orders_spec(&server.uri())))
        .mount(&server)
        .await;

    let gateway = gateway();
    register_and_refresh(&gateway, &server).await;

    let duplicate = gateway
        .bus
        .execute(RegisterSource {
            id: "orders".into(),
            name: "Orders again".into(),
            url: server.uri(),
            spec_url: None,
            source_type: SourceType::Openapi,
            auth_mode: AuthMode::None,
            default_audience: None,
            required_scopes: Vec::new(),
            mcp_config: None,
            validate: false,
        })
        .await;
    assert_eq!(duplicate.status(), 409);
}

#[tokio::test]
async fn disabled_tool_is_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(orders_spec(&server.uri())))
        .mount(&server)
        .await;

    let gateway = gateway();
    register_and_refresh(&gateway, &server).await;

    let disabled = gateway
        .bus
        .execute(DisableTool {
            tool_id: "orders:get_order".into(),
        })
        .await;
    assert!(disabled.is_ok());

    let executed = gateway
        .bus
        .execute(ExecuteTool {
            tool_id: "orders:get_order".into(),
            arguments: Map::new(),
            agent_token: String::new(),
            validate_schema: None,
        })
        .await;
    assert_eq!(executed.status(), 403);
}

#[tokio::test]
async fn unknown_tool_is_not_found() {
    let gateway = gateway();
    let executed = gateway
        .bus
        .execute(ExecuteTool {
            tool_id: "nowhere:nothing".into(),
            arguments: Map::new(),
            agent_token: String::new(),
            validate_schema: None,
        })
        .await;
    match executed {
        OperationResult::NotFound { resource_type, id } => {
            assert_eq!(resource_type, "tool");
            assert_eq!(id, "nowhere:nothing");
        }
        other => panic!("expected NotFound, got status {}", other.status()),
    }
}

#[tokio::test]
async fn delete_source_deprecates_tools_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(orders_spec(&server.uri())))
        .mount(&server)
        .await;

    let gateway = gateway();
    register_and_refresh(&gateway, &server).await;

    let deleted = gateway
        .bus
        .execute(DeleteSource {
            source_id: "orders".into(),
        })
        .await;
    assert_eq!(deleted.into_data().unwrap(), 1);
    assert!(gateway.sources.get("orders").await.unwrap().is_none());
    let tool = gateway.tools.get("orders:get_order").await.unwrap().unwrap();
    assert_eq!(tool.status, ToolStatus::Deprecated);

    // The deprecated leftover is now orphaned; dry-run reports it, the
    // destructive pass removes it.
    let dry = gateway
        .bus
        .execute(CleanupOrphanedTools { dry_run: true })
        .await
        .into_data()
        .unwrap();
    assert_eq!(dry, vec!["orders:get_order".to_string()]);
    assert!(gateway.tools.get("orders:get_order").await.unwrap().is_some());

    let destructive = gateway
        .bus
        .execute(CleanupOrphanedTools { dry_run: false })
        .await
        .into_data()
        .unwrap();
    assert_eq!(destructive.len(), 1);
    assert!(gateway.tools.get("orders:get_order").await.unwrap().is_none());
}

#[tokio::test]
async fn circuit_breaker_reset_by_key_and_globally() {
    let gateway = gateway();

    // Unknown key: not found.
    let missing = gateway
        .bus
        .execute(ResetCircuitBreaker {
            key: Some("never-used".into()),
        })
        .await;
    assert_eq!(missing.status(), 404);

    // Global reset succeeds even with no breakers yet.
    let all = gateway.bus.execute(ResetCircuitBreaker { key: None }).await;
    assert_eq!(all.into_data().unwrap(), 0);
}

#[tokio::test]
async fn builtin_source_registers_and_executes_locally() {
    let gateway = gateway();
    let registered = gateway
        .bus
        .execute(RegisterSource {
            id: "builtin".into(),
            name: "Built-in tools".into(),
            url: "builtin://".into(),
            spec_url: None,
            source_type: SourceType::Builtin,
            auth_mode: AuthMode::None,
            default_audience: None,
            required_scopes: Vec::new(),
            mcp_config: None,
            validate: true,
        })
        .await;
    assert!(registered.is_ok());

    let refreshed = gateway
        .bus
        .execute(RefreshInventory {
            source_id: "builtin".into(),
            force: false,
        })
        .await
        .into_data()
        .unwrap();
    assert!(refreshed.tools_created >= 16);

    let mut arguments = Map::new();
    arguments.insert("expression".into(), json!("6 * 7"));
    let executed = gateway
        .bus
        .execute(ExecuteTool {
            tool_id: "builtin:calculate".into(),
            arguments,
            agent_token: String::new(),
            validate_schema: None,
        })
        .await
        .into_data()
        .unwrap();
    assert_eq!(executed.status, ExecutionStatus::Completed);
    assert_eq!(executed.result.unwrap()["result"], 42.0);
}
