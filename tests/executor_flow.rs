//! End-to-end execution scenarios: token exchange and call, async polling,
//! circuit opening, and validation short-circuits.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use toolgate::breaker::{CircuitBreakerRegistry, CircuitState};
use toolgate::builtins::BuiltinRegistry;
use toolgate::config::{
    BuiltinSettings, CircuitBreakerSettings, ExecutorSettings, IdpSettings, TokenCacheSettings,
};
use toolgate::domain::{AuthMode, ExecutionMode, ExecutionProfile, PollConfig, ToolDefinition};
use toolgate::executor::{ExecuteToolRequest, ExecutionStatus, ToolExecutor};
use toolgate::auth::{ClientCredentialsService, TokenExchanger};
use toolgate::sources::McpSourceAdapter;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Stack {
    executor: ToolExecutor,
    breakers: Arc<CircuitBreakerRegistry>,
}

fn stack(idp: &MockServer, breaker_settings: CircuitBreakerSettings) -> Stack {
    let http = reqwest::Client::new();
    let breakers = CircuitBreakerRegistry::new(breaker_settings);
    let idp_settings = IdpSettings {
        token_url: format!("{}/token", idp.uri()),
        client_id: "toolgate".into(),
        client_secret: "s3cr3t".into(),
        timeout_secs: 5,
    };
    let executor = ToolExecutor::new(
        ExecutorSettings::default(),
        Arc::new(TokenExchanger::new(
            http.clone(),
            idp_settings.clone(),
            TokenCacheSettings::default(),
            breakers.clone(),
        )),
        Arc::new(ClientCredentialsService::new(
            http,
            idp_settings,
            TokenCacheSettings::default(),
        )),
        breakers.clone(),
        BuiltinRegistry::standard(&BuiltinSettings::default()),
        Arc::new(McpSourceAdapter::new()),
    );
    Stack { executor, breakers }
}

fn arguments(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn mount_exchange(idp: &MockServer, expected_audience: &str, issued: &str) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(format!("audience={}", expected_audience)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": issued,
            "expires_in": 300,
            "token_type": "Bearer"
        })))
        .mount(idp)
        .await;
}

#[tokio::test]
async fn exchange_and_call() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    mount_exchange(&idp, "order-api", "exchanged-token").await;
    Mock::given(method("GET"))
        .and(path("/orders/42"))
        .and(header("Authorization", "Bearer exchanged-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42", "status": "shipped"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let tool = ToolDefinition {
        name: "get_order".into(),
        execution_profile: ExecutionProfile {
            url_template: format!("{}/orders/{{{{ id }}}}", upstream.uri()),
            required_audience: Some("order-api".into()),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = stack
        .executor
        .execute(ExecuteToolRequest {
            tool_id: "orders:get_order".into(),
            definition: tool,
            arguments: arguments(json!({"id": "42"})),
            agent_token: "agent-jwt".into(),
            source_id: "orders".into(),
            auth_mode: AuthMode::TokenExchange,
            auth_config: None,
            default_audience: Some("order-api".into()),
            mcp_config: None,
            validate_schema: None,
        })
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    assert_eq!(result.result.unwrap()["status"], "shipped");
}

#[tokio::test]
async fn repeated_calls_reuse_the_cached_exchange() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    // Exactly one exchange for two tool calls.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "exchanged-token",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&idp)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(2)
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let request = ExecuteToolRequest {
        tool_id: "orders:ping".into(),
        definition: ToolDefinition {
            name: "ping".into(),
            execution_profile: ExecutionProfile {
                url_template: format!("{}/ping", upstream.uri()),
                required_audience: Some("order-api".into()),
                ..Default::default()
            },
            ..Default::default()
        },
        arguments: Map::new(),
        agent_token: "agent-jwt".into(),
        source_id: "orders".into(),
        auth_mode: AuthMode::TokenExchange,
        auth_config: None,
        default_audience: None,
        mcp_config: None,
        validate_schema: None,
    };

    assert!(stack.executor.execute(request.clone()).await.is_completed());
    assert!(stack.executor.execute(request).await.is_completed());
}

#[tokio::test]
async fn empty_audience_passes_the_agent_token_through() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Authorization", "Bearer agent-jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let result = stack
        .executor
        .execute(ExecuteToolRequest {
            tool_id: "orders:ping".into(),
            definition: ToolDefinition {
                name: "ping".into(),
                execution_profile: ExecutionProfile {
                    url_template: format!("{}/ping", upstream.uri()),
                    ..Default::default()
                },
                ..Default::default()
            },
            arguments: Map::new(),
            agent_token: "agent-jwt".into(),
            source_id: "orders".into(),
            auth_mode: AuthMode::TokenExchange,
            auth_config: None,
            default_audience: None,
            mcp_config: None,
            validate_schema: None,
        })
        .await;
    assert!(result.is_completed(), "{:?}", result.error);
    // No exchange ever hit the IdP.
    assert!(idp.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn async_poll_completes_on_third_attempt() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "J1"})))
        .mount(&upstream)
        .await;
    // First two polls run, third is done.
    Mock::given(method("GET"))
        .and(path("/jobs/J1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
        .up_to_n_times(2)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/J1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "done",
            "output": {"url": "https://files.example.com/report.pdf"}
        })))
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let tool = ToolDefinition {
        name: "generate_report".into(),
        execution_profile: ExecutionProfile {
            mode: ExecutionMode::AsyncPoll,
            method: "POST".into(),
            url_template: format!("{}/reports", upstream.uri()),
            poll_config: Some(PollConfig {
                status_url_template: format!("{}/jobs/{{{{ jobId }}}}", upstream.uri()),
                status_field_path: "state".into(),
                result_field_path: Some("output".into()),
                completed_values: vec!["done".into()],
                failed_values: vec!["error".into()],
                poll_interval_seconds: 0.01,
                max_interval_seconds: 0.05,
                backoff_multiplier: 1.5,
                max_poll_attempts: 10,
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = stack
        .executor
        .execute(ExecuteToolRequest {
            tool_id: "reports:generate_report".into(),
            definition: tool,
            arguments: Map::new(),
            agent_token: String::new(),
            source_id: "reports".into(),
            auth_mode: AuthMode::None,
            auth_config: None,
            default_audience: None,
            mcp_config: None,
            validate_schema: None,
        })
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    assert_eq!(
        result.result.unwrap()["url"],
        "https://files.example.com/report.pdf"
    );
    assert_eq!(result.metadata["poll_attempts"], 3);
}

#[tokio::test]
async fn async_poll_gives_up_after_max_attempts() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "J2"})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let tool = ToolDefinition {
        name: "generate_report".into(),
        execution_profile: ExecutionProfile {
            mode: ExecutionMode::AsyncPoll,
            method: "POST".into(),
            url_template: format!("{}/reports", upstream.uri()),
            poll_config: Some(PollConfig {
                status_url_template: format!("{}/jobs/{{{{ jobId }}}}", upstream.uri()),
                status_field_path: "state".into(),
                result_field_path: None,
                completed_values: vec!["done".into()],
                failed_values: vec!["error".into()],
                poll_interval_seconds: 0.01,
                max_interval_seconds: 0.02,
                backoff_multiplier: 2.0,
                max_poll_attempts: 3,
            }),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = stack
        .executor
        .execute(ExecuteToolRequest {
            tool_id: "reports:generate_report".into(),
            definition: tool,
            arguments: Map::new(),
            agent_token: String::new(),
            source_id: "reports".into(),
            auth_mode: AuthMode::None,
            auth_config: None,
            default_audience: None,
            mcp_config: None,
            validate_schema: None,
        })
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.error_code, "poll_timeout");
    assert_eq!(error.details["max_attempts"], 3);
}

#[tokio::test]
async fn five_timeouts_open_the_circuit_and_recovery_closes_it() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    // Five 500s, then health.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(5)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let stack = stack(
        &idp,
        CircuitBreakerSettings {
            failure_threshold: 5,
            recovery_timeout_secs: 0,
            half_open_max_calls: 3,
        },
    );
    let request = ExecuteToolRequest {
        tool_id: "orders:get_order".into(),
        definition: ToolDefinition {
            name: "get_order".into(),
            execution_profile: ExecutionProfile {
                url_template: format!("{}/orders/1", upstream.uri()),
                ..Default::default()
            },
            ..Default::default()
        },
        arguments: Map::new(),
        agent_token: String::new(),
        source_id: "orders".into(),
        auth_mode: AuthMode::None,
        auth_config: None,
        default_audience: None,
        mcp_config: None,
        validate_schema: None,
    };

    for _ in 0..5 {
        let result = stack.executor.execute(request.clone()).await;
        assert_eq!(result.error.unwrap().error_code, "upstream_error");
    }
    let breaker = stack.breakers.get_or_create("orders", "tool_call", "orders").await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Recovery timeout is zero: the next call is admitted as a half-open
    // probe, succeeds, and closes the breaker.
    let result = stack.executor.execute(request).await;
    assert!(result.is_completed(), "{:?}", result.error);
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn open_circuit_rejects_without_reaching_upstream() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&upstream)
        .await;

    let stack = stack(
        &idp,
        CircuitBreakerSettings {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        },
    );
    let request = ExecuteToolRequest {
        tool_id: "orders:get_order".into(),
        definition: ToolDefinition {
            name: "get_order".into(),
            execution_profile: ExecutionProfile {
                url_template: format!("{}/orders/1", upstream.uri()),
                ..Default::default()
            },
            ..Default::default()
        },
        arguments: Map::new(),
        agent_token: String::new(),
        source_id: "orders".into(),
        auth_mode: AuthMode::None,
        auth_config: None,
        default_audience: None,
        mcp_config: None,
        validate_schema: None,
    };

    let first = stack.executor.execute(request.clone()).await;
    assert_eq!(first.error.unwrap().error_code, "upstream_error");

    // The wiremock expectation of exactly one request proves the fast-fail.
    let second = stack.executor.execute(request).await;
    assert_eq!(second.error.unwrap().error_code, "circuit_open");
}

#[tokio::test]
async fn validation_failure_never_reaches_the_upstream() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let stack = stack(&idp, CircuitBreakerSettings::default());
    let tool = ToolDefinition {
        name: "create_user".into(),
        input_schema: json!({
            "type": "object",
            "properties": {"email": {"type": "string"}},
            "required": ["email"]
        }),
        execution_profile: ExecutionProfile {
            method: "POST".into(),
            url_template: format!("{}/users", upstream.uri()),
            ..Default::default()
        },
        ..Default::default()
    };

    let result = stack
        .executor
        .execute(ExecuteToolRequest {
            tool_id: "users:create_user".into(),
            definition: tool,
            arguments: Map::new(),
            agent_token: String::new(),
            source_id: "users".into(),
            auth_mode: AuthMode::None,
            auth_config: None,
            default_audience: None,
            mcp_config: None,
            validate_schema: None,
        })
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.error_code, "validation_error");
    assert_eq!(
        error.details["validation_errors"][0],
        "email: is a required property"
    );
}
