//! Tool execution: validate → resolve credential → render → call → classify,
//! with built-in short-circuit, MCP proxying, and async-poll completion.

pub mod response;

use crate::auth::claims::user_context_or_anonymous;
use crate::auth::{ClientCredentialsService, TokenExchanger};
use crate::breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::builtins::{BuiltinRegistry, BuiltinToolResult};
use crate::config::ExecutorSettings;
use crate::domain::auth::ApiKeyLocation;
use crate::domain::{AuthConfig, AuthMode, ExecutionMode, ExecutionProfile, McpSourceConfig, PollConfig, ToolDefinition};
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use crate::schema::SchemaValidator;
use crate::sources::McpSourceAdapter;
use crate::template;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Error object carried on the wire for failed executions.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionError {
    pub message: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

/// Uniform wire shape for both success and failure.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteToolResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ExecuteToolResult {
    fn completed(result: Value) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result: Some(result),
            error: None,
            execution_time_ms: 0,
            upstream_status: None,
            metadata: Map::new(),
        }
    }

    fn failed_with_result(result: Value, upstream_status: u16) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: Some(result),
            error: None,
            execution_time_ms: 0,
            upstream_status: Some(upstream_status),
            metadata: Map::new(),
        }
    }

    fn from_error(err: ToolgateError) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: None,
            error: Some(ExecutionError {
                message: err.message.clone(),
                error_code: err.error_code().to_string(),
                details: err.details,
            }),
            execution_time_ms: 0,
            upstream_status: err.upstream_status,
            metadata: Map::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// One invocation as handed to [`ToolExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteToolRequest {
    pub tool_id: String,
    pub definition: ToolDefinition,
    pub arguments: Map<String, Value>,
    /// May be empty; TOKEN_EXCHANGE without an audience passes it through.
    pub agent_token: String,
    pub source_id: String,
    pub auth_mode: AuthMode,
    pub auth_config: Option<AuthConfig>,
    pub default_audience: Option<String>,
    pub mcp_config: Option<McpSourceConfig>,
    /// Per-call override of the global validation toggle.
    pub validate_schema: Option<bool>,
}

struct HttpOutcome {
    status: u16,
    body: Value,
}

/// Orchestrates one tool invocation end to end.
pub struct ToolExecutor {
    http: reqwest::Client,
    settings: ExecutorSettings,
    validator: SchemaValidator,
    exchanger: Arc<TokenExchanger>,
    client_credentials: Arc<ClientCredentialsService>,
    breakers: Arc<CircuitBreakerRegistry>,
    builtins: Arc<BuiltinRegistry>,
    mcp: Arc<McpSourceAdapter>,
}

impl ToolExecutor {
    pub fn new(
        settings: ExecutorSettings,
        exchanger: Arc<TokenExchanger>,
        client_credentials: Arc<ClientCredentialsService>,
        breakers: Arc<CircuitBreakerRegistry>,
        builtins: Arc<BuiltinRegistry>,
        mcp: Arc<McpSourceAdapter>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let validator = SchemaValidator::new(settings.validate_arguments);
        Self {
            http,
            settings,
            validator,
            exchanger,
            client_credentials,
            breakers,
            builtins,
            mcp,
        }
    }

    /// Execute one invocation. Every outcome, success or failure, is an
    /// [`ExecuteToolResult`]; nothing escapes as an error.
    pub async fn execute(&self, request: ExecuteToolRequest) -> ExecuteToolResult {
        let started = Instant::now();
        let tool_id = request.tool_id.clone();
        let mut result = match self.run(&request).await {
            Ok(result) => result,
            Err(err) => {
                warn!("tool '{}' failed: {}", tool_id, err);
                ExecuteToolResult::from_error(err)
            }
        };
        result.execution_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            "tool '{}' finished: {:?} in {}ms",
            tool_id, result.status, result.execution_time_ms
        );
        result
    }

    async fn run(&self, request: &ExecuteToolRequest) -> ToolgateResult<ExecuteToolResult> {
        let profile = &request.definition.execution_profile;

        // 1. Validate arguments before anything leaves the process.
        self.validator.validate(
            &request.definition.input_schema,
            &Value::Object(request.arguments.clone()),
            request.validate_schema,
        )?;

        // 2. Built-in short-circuit: no token, no HTTP.
        if request.definition.is_builtin() || profile.mode == ExecutionMode::Builtin {
            return Ok(self.execute_builtin(request).await);
        }

        // MCP calls are proxied over the open protocol connection.
        if profile.mode == ExecutionMode::McpCall {
            return self.execute_mcp(request).await;
        }

        // 3. Upstream credential per auth mode.
        let token = self.resolve_credential(request).await?;

        // 4. Render URL, headers, body.
        let mut url = template::render_url(&profile.url_template, &request.arguments)?;
        if let Some(AuthConfig::ApiKey { name, value, location: ApiKeyLocation::Query }) =
            &request.auth_config
        {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{}{}{}={}", url, separator, name, urlencoding::encode(value));
        }
        let headers = self.render_headers(profile, request, token.as_deref())?;
        let body = match &profile.body_template {
            Some(body_template) => Some(template::render_body(body_template, &request.arguments)?),
            None => None,
        };

        // 5. HTTP through the breaker.
        let breaker = self.breaker_for(request, &url).await;
        let timeout = Duration::from_secs(
            profile.timeout_seconds.unwrap_or(self.settings.default_timeout_secs),
        );
        let outcome = breaker
            .call(|| {
                self.do_http(
                    &profile.method,
                    &url,
                    &headers,
                    body.as_deref(),
                    &profile.content_type,
                    timeout,
                )
            })
            .await?;

        // 6./7. Classify; 4xx surfaces the body to the agent.
        if (400..500).contains(&outcome.status) {
            return Ok(ExecuteToolResult::failed_with_result(outcome.body, outcome.status));
        }

        // 8. Async poll treats the call so far as the trigger.
        if profile.mode == ExecutionMode::AsyncPoll {
            let poll_config = profile.poll_config.as_ref().ok_or_else(|| {
                ToolgateError::internal("ASYNC_POLL profile has no poll_config")
                    .with_detail("error_code", json!("missing_poll_config"))
            })?;
            return self
                .poll_for_completion(request, profile, poll_config, &headers, &breaker, outcome)
                .await;
        }

        let mapped = self.map_response(profile, outcome.body);
        let mut result = ExecuteToolResult::completed(mapped);
        result.upstream_status = Some(outcome.status);
        Ok(result)
    }

    async fn execute_builtin(&self, request: &ExecuteToolRequest) -> ExecuteToolResult {
        let profile = &request.definition.execution_profile;
        let name = profile
            .url_template
            .strip_prefix(ToolDefinition::BUILTIN_SCHEME)
            .unwrap_or(&request.definition.name);
        let user = user_context_or_anonymous(&request.agent_token);
        let outcome: BuiltinToolResult =
            self.builtins.execute(name, &request.arguments, &user).await;

        if outcome.success {
            let mut result = ExecuteToolResult::completed(outcome.result.unwrap_or(Value::Null));
            if let Some(metadata) = outcome.metadata {
                result.metadata = metadata;
            }
            result
        } else {
            ExecuteToolResult {
                status: ExecutionStatus::Failed,
                result: None,
                error: Some(ExecutionError {
                    message: outcome.error.unwrap_or_else(|| "builtin execution failed".into()),
                    error_code: "builtin_execution_error".into(),
                    details: BTreeMap::new(),
                }),
                execution_time_ms: 0,
                upstream_status: None,
                metadata: outcome.metadata.unwrap_or_default(),
            }
        }
    }

    async fn execute_mcp(&self, request: &ExecuteToolRequest) -> ToolgateResult<ExecuteToolResult> {
        let config = request.mcp_config.as_ref().ok_or_else(|| {
            ToolgateError::internal("MCP_CALL tool without mcp_config on its source")
        })?;
        let value = self
            .mcp
            .call_tool(config, &request.definition.name, request.arguments.clone())
            .await?;
        Ok(ExecuteToolResult::completed(value))
    }

    /// Credential per the auth-mode table. API key and basic auth are
    /// handled during header rendering, not here.
    async fn resolve_credential(&self, request: &ExecuteToolRequest) -> ToolgateResult<Option<String>> {
        let profile = &request.definition.execution_profile;
        match request.auth_mode {
            AuthMode::None | AuthMode::ApiKey | AuthMode::HttpBasic => Ok(None),
            AuthMode::ClientCredentials => {
                let entry = match &request.auth_config {
                    Some(AuthConfig::Oauth2 { token_url, client_id, client_secret, scopes }) => {
                        self.client_credentials
                            .get_token_for(token_url, client_id, client_secret, scopes)
                            .await?
                    }
                    _ => {
                        self.client_credentials
                            .get_token(&profile.required_scopes)
                            .await?
                    }
                };
                Ok(Some(entry.access_token))
            }
            AuthMode::TokenExchange => {
                let audience = profile
                    .required_audience
                    .clone()
                    .or_else(|| request.default_audience.clone())
                    .filter(|aud| !aud.is_empty());
                match audience {
                    // No audience: the agent token passes through unchanged.
                    None => {
                        if request.agent_token.is_empty() {
                            Ok(None)
                        } else {
                            Ok(Some(request.agent_token.clone()))
                        }
                    }
                    Some(audience) => {
                        let entry = self
                            .exchanger
                            .exchange(&request.agent_token, &audience, &profile.required_scopes)
                            .await?;
                        Ok(Some(entry.access_token))
                    }
                }
            }
        }
    }

    fn render_headers(
        &self,
        profile: &ExecutionProfile,
        request: &ExecuteToolRequest,
        token: Option<&str>,
    ) -> ToolgateResult<BTreeMap<String, String>> {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();

        match (&request.auth_mode, &request.auth_config) {
            (AuthMode::ApiKey, Some(AuthConfig::ApiKey { name, value, location: ApiKeyLocation::Header })) => {
                headers.insert(name.clone(), value.clone());
            }
            (AuthMode::HttpBasic, Some(AuthConfig::HttpBasic { username, password })) => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                headers.insert("Authorization".into(), format!("Basic {}", encoded));
            }
            (AuthMode::HttpBasic, _) => {
                warn!(
                    "source '{}' uses HTTP_BASIC but no credentials are in the secrets store",
                    request.source_id
                );
            }
            _ => {}
        }
        if let (Some(token), AuthMode::ClientCredentials | AuthMode::TokenExchange) =
            (token, request.auth_mode)
        {
            headers.insert("Authorization".into(), format!("Bearer {}", token));
        }

        let api_key_header = match &request.auth_config {
            Some(AuthConfig::ApiKey { name, .. }) => Some(name.to_lowercase()),
            _ => None,
        };
        for (key, header_template) in &profile.headers_template {
            let key_lower = key.to_lowercase();
            // Injected credentials win over template-declared ones.
            if key_lower == "authorization" && headers.contains_key("Authorization") {
                continue;
            }
            if api_key_header.as_deref() == Some(key_lower.as_str()) {
                continue;
            }
            let rendered = template::render(
                header_template,
                &request.arguments,
                &format!("header:{}", key),
            )?;
            headers.insert(key.clone(), rendered);
        }
        Ok(headers)
    }

    async fn breaker_for(&self, request: &ExecuteToolRequest, url: &str) -> Arc<CircuitBreaker> {
        let key = if request.source_id.is_empty() {
            url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| url.to_string())
        } else {
            request.source_id.clone()
        };
        self.breakers
            .get_or_create(&key, "tool_call", &request.source_id)
            .await
    }

    async fn do_http(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&str>,
        content_type: &str,
        timeout: Duration,
    ) -> ToolgateResult<HttpOutcome> {
        let method: reqwest::Method = method.parse().map_err(|_| {
            ToolgateError::internal(format!("unsupported HTTP method '{}'", method))
        })?;
        let mut builder = self.http.request(method, url).timeout(timeout);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.to_string());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolgateError::new(
                    ErrorKind::UpstreamTimeout,
                    format!("upstream call timed out after {}s", timeout.as_secs()),
                )
            } else if e.is_connect() {
                ToolgateError::new(
                    ErrorKind::UpstreamConnectionError,
                    format!("cannot connect to upstream: {}", e),
                )
            } else {
                ToolgateError::new(ErrorKind::UpstreamConnectionError, format!("upstream call failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(crate::utils::http::is_json_content);
        let text = response.text().await.unwrap_or_default();

        if status >= 500 {
            return Err(ToolgateError::new(
                ErrorKind::UpstreamError,
                format!("upstream returned {}", status),
            )
            .with_upstream_status(status)
            .with_upstream_body(&text));
        }

        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };
        Ok(HttpOutcome { status, body })
    }

    fn map_response(&self, profile: &ExecutionProfile, body: Value) -> Value {
        match &profile.response_mapping {
            Some(mapping) if !mapping.is_empty() => response::apply_mapping(mapping, &body),
            _ => body,
        }
    }

    async fn poll_for_completion(
        &self,
        request: &ExecuteToolRequest,
        profile: &ExecutionProfile,
        poll_config: &PollConfig,
        headers: &BTreeMap<String, String>,
        breaker: &Arc<CircuitBreaker>,
        trigger: HttpOutcome,
    ) -> ToolgateResult<ExecuteToolResult> {
        // The trigger response joins the argument scope so the status URL
        // can reference fields like {{ jobId }}.
        let mut scope = request.arguments.clone();
        if let Value::Object(fields) = &trigger.body {
            for (key, value) in fields {
                scope.insert(key.clone(), value.clone());
            }
        }

        let timeout = Duration::from_secs(self.settings.default_timeout_secs);
        let mut interval = poll_config.poll_interval_seconds.max(0.0);
        let max_attempts = poll_config.max_poll_attempts.min(self.settings.max_poll_attempts);

        for attempt in 1..=max_attempts {
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;

            let status_url = template::render_url(&poll_config.status_url_template, &scope)?;
            let outcome = breaker
                .call(|| self.do_http("GET", &status_url, headers, None, &profile.content_type, timeout))
                .await?;
            if (400..500).contains(&outcome.status) {
                return Ok(ExecuteToolResult::failed_with_result(outcome.body, outcome.status));
            }

            let status_value = response::extract_path(&outcome.body, &poll_config.status_field_path)
                .map(comparable)
                .unwrap_or_default();

            if poll_config.completed_values.contains(&status_value) {
                let extracted = match &poll_config.result_field_path {
                    Some(path) => response::extract_path(&outcome.body, path)
                        .cloned()
                        .unwrap_or(Value::Null),
                    None => outcome.body,
                };
                let mut result = ExecuteToolResult::completed(self.map_response(profile, extracted));
                result.metadata.insert("poll_attempts".into(), json!(attempt));
                info!(
                    "async tool '{}' completed after {} poll(s)",
                    request.tool_id, attempt
                );
                return Ok(result);
            }
            if poll_config.failed_values.contains(&status_value) {
                let mut result = ExecuteToolResult::failed_with_result(outcome.body, outcome.status);
                result.metadata.insert("poll_attempts".into(), json!(attempt));
                return Ok(result);
            }

            interval = (interval * poll_config.backoff_multiplier.max(1.0))
                .min(poll_config.max_interval_seconds);
            debug!(
                "tool '{}' still pending (status '{}'), next poll in {:.1}s",
                request.tool_id, status_value, interval
            );
        }

        Err(ToolgateError::new(
            ErrorKind::PollTimeout,
            format!(
                "async operation did not complete within {} attempts",
                max_attempts
            ),
        )
        .with_detail("max_attempts", json!(max_attempts)))
    }
}

/// Status values compare as strings; non-string JSON values use their
/// compact spelling.
fn comparable(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
