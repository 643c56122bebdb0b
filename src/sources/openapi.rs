use crate::domain::{AuthConfig, ExecutionMode, ExecutionProfile, McpSourceConfig, SourceType, ToolDefinition};
use crate::sources::{IngestionResult, SourceAdapter};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// HTTP methods exposed as tools. HEAD and OPTIONS are not useful to agents.
const SUPPORTED_METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];

/// Methods that carry a request body.
const METHODS_WITH_BODY: [&str; 3] = ["post", "put", "patch"];

const USER_AGENT: &str = concat!("toolgate/", env!("CARGO_PKG_VERSION"));

fn path_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("static regex"))
}

/// Parses OpenAPI 3.0.x / 3.1.x documents (JSON or YAML) into normalized
/// tool definitions. Swagger 2.0 is rejected with a specific error.
pub struct OpenApiSourceAdapter {
    http: reqwest::Client,
    timeout_secs: u64,
}

impl OpenApiSourceAdapter {
    pub fn new(http: reqwest::Client, timeout_secs: u64) -> Self {
        Self { http, timeout_secs }
    }

    /// Normalize an already-parsed OpenAPI document. Exposed so callers with
    /// a local document can skip the fetch.
    pub fn normalize_document(
        &self,
        spec: &Value,
        spec_url: &str,
        default_audience: Option<&str>,
    ) -> IngestionResult {
        if let Some(error) = validate_spec(spec) {
            return IngestionResult::failure(error);
        }

        let base_url = extract_base_url(spec, spec_url);
        let source_version = spec
            .pointer("/info/version")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut tools = Vec::new();
        let mut warnings = Vec::new();
        let paths = spec.get("paths").and_then(Value::as_object);
        for (path, path_item) in paths.into_iter().flatten() {
            let Some(path_item) = path_item.as_object() else {
                continue;
            };
            for (method, operation) in path_item {
                let method = method.to_lowercase();
                if !SUPPORTED_METHODS.contains(&method.as_str()) {
                    continue;
                }
                let Some(operation) = operation.as_object() else {
                    continue;
                };
                match parse_operation(
                    spec,
                    path,
                    &method,
                    operation,
                    &base_url,
                    default_audience,
                    self.timeout_secs,
                    &mut warnings,
                ) {
                    Ok(tool) => tools.push(tool),
                    Err(e) => {
                        let warning =
                            format!("failed to parse operation {} {}: {}", method.to_uppercase(), path, e);
                        warn!("{}", warning);
                        warnings.push(warning);
                    }
                }
            }
        }

        if tools.is_empty() {
            return IngestionResult::failure("no valid operations found in OpenAPI document");
        }
        info!("normalized {} tools from OpenAPI document at {}", tools.len(), spec_url);
        IngestionResult::ok(tools, source_version, warnings)
    }

    async fn fetch_spec(
        &self,
        url: &str,
        auth_config: Option<&AuthConfig>,
    ) -> Result<String, String> {
        let mut request = self
            .http
            .get(url)
            .header("Accept", "application/json, application/yaml, text/yaml, */*")
            .header("User-Agent", USER_AGENT)
            .timeout(Duration::from_secs(self.timeout_secs));

        match auth_config {
            Some(AuthConfig::Bearer { token }) => {
                request = request.bearer_auth(token);
            }
            Some(AuthConfig::ApiKey { name, value, location })
                if *location == crate::domain::auth::ApiKeyLocation::Header =>
            {
                request = request.header(name.as_str(), value.as_str());
            }
            Some(AuthConfig::HttpBasic { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            _ => {}
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                format!("request timed out after {} seconds", self.timeout_secs)
            } else if e.is_connect() {
                format!("failed to connect to {}", url)
            } else {
                format!("failed to fetch specification: {}", e)
            }
        })?;

        match response.status().as_u16() {
            200..=299 => response
                .text()
                .await
                .map_err(|e| format!("failed to read specification body: {}", e)),
            401 => Err("authentication required but credentials invalid or missing".into()),
            403 => Err("access forbidden - insufficient permissions".into()),
            404 => Err("OpenAPI specification not found at URL".into()),
            status => Err(format!("HTTP error {}", status)),
        }
    }
}

#[async_trait]
impl SourceAdapter for OpenApiSourceAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Openapi
    }

    async fn fetch_and_normalize(
        &self,
        url: &str,
        auth_config: Option<&AuthConfig>,
        default_audience: Option<&str>,
        _mcp_config: Option<&McpSourceConfig>,
    ) -> IngestionResult {
        info!("fetching OpenAPI spec from {}", url);
        let content = match self.fetch_spec(url, auth_config).await {
            Ok(content) => content,
            Err(error) => return IngestionResult::failure(error),
        };
        let spec = match parse_spec(&content) {
            Ok(spec) => spec,
            Err(error) => return IngestionResult::failure(error),
        };
        self.normalize_document(&spec, url, default_audience)
    }

    async fn validate_url(&self, url: &str, auth_config: Option<&AuthConfig>) -> bool {
        match self.fetch_spec(url, auth_config).await {
            Ok(content) => parse_spec(&content)
                .map(|spec| validate_spec(&spec).is_none())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Parse the raw document as JSON first (most common), then YAML.
fn parse_spec(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON: {}", e));
    }
    match serde_yaml_ng::from_str::<Value>(trimmed) {
        Ok(spec @ Value::Object(_)) => Ok(spec),
        Ok(_) => Err("YAML content is not a valid OpenAPI document".into()),
        Err(e) => Err(format!("invalid YAML: {}", e)),
    }
}

fn validate_spec(spec: &Value) -> Option<String> {
    let Some(openapi_version) = spec.get("openapi") else {
        if spec.get("swagger").is_some() {
            return Some("Swagger 2.0 is not supported. Please upgrade to OpenAPI 3.x".into());
        }
        return Some("missing 'openapi' field - not a valid OpenAPI specification".into());
    };
    let version = openapi_version.as_str().unwrap_or_default();
    if !version.starts_with("3.") {
        return Some(format!(
            "OpenAPI version {} is not supported. Only 3.x is supported.",
            version
        ));
    }
    if spec.get("info").is_none() {
        return Some("missing 'info' field in OpenAPI specification".into());
    }
    if spec.get("paths").is_none() {
        return Some("missing 'paths' field in OpenAPI specification".into());
    }
    None
}

/// Base URL: `servers[0].url` (relative resolved against the spec URL), or
/// the spec URL's scheme + host.
fn extract_base_url(spec: &Value, spec_url: &str) -> String {
    if let Some(server_url) = spec.pointer("/servers/0/url").and_then(Value::as_str) {
        if let Some(relative) = server_url.strip_prefix('/') {
            if let Some(origin) = url_origin(spec_url) {
                return format!("{}/{}", origin, relative);
            }
        } else if !server_url.is_empty() {
            return server_url.to_string();
        }
    }
    url_origin(spec_url).unwrap_or_else(|| spec_url.to_string())
}

fn url_origin(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_operation(
    spec: &Value,
    path: &str,
    method: &str,
    operation: &Map<String, Value>,
    base_url: &str,
    default_audience: Option<&str>,
    timeout_secs: u64,
    warnings: &mut Vec<String>,
) -> anyhow::Result<ToolDefinition> {
    let name = operation
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| generate_operation_id(method, path));

    let description = operation
        .get("description")
        .or_else(|| operation.get("summary"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", method.to_uppercase(), path));

    let input_schema = build_input_schema(spec, method, operation, warnings);
    let url_template = build_url_template(spec, base_url, path, operation, warnings);
    let body_template = if METHODS_WITH_BODY.contains(&method) {
        build_body_template(spec, operation, warnings)
    } else {
        None
    };

    let tags = operation
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let required_audience = extract_required_audience(spec, operation)
        .or_else(|| default_audience.map(str::to_string))
        .filter(|aud| !aud.is_empty());

    let execution_profile = ExecutionProfile {
        mode: ExecutionMode::SyncHttp,
        method: method.to_uppercase(),
        url_template,
        headers_template: Default::default(),
        body_template,
        content_type: request_content_type(operation),
        required_audience,
        required_scopes: Vec::new(),
        timeout_seconds: Some(timeout_secs),
        poll_config: None,
        response_mapping: None,
    };

    Ok(ToolDefinition {
        name,
        description,
        input_schema,
        source_path: path.to_string(),
        tags,
        deprecated: operation
            .get("deprecated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        execution_profile,
    })
}

/// `GET /users/{id}` without an operationId becomes `get_users_id`.
fn generate_operation_id(method: &str, path: &str) -> String {
    let path_id = path
        .trim_matches('/')
        .replace(['{', '}'], "")
        .split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if path_id.is_empty() {
        method.to_string()
    } else {
        format!("{}_{}", method, path_id)
    }
}

/// Build the URL template: `{param}` becomes `{{ param }}`; query parameters
/// are appended with a required parameter anchoring the `?` when one exists,
/// and pure conditional `&name=` blocks otherwise (the renderer promotes the
/// first `&` to `?` when at least one argument is supplied).
fn build_url_template(
    spec: &Value,
    base_url: &str,
    path: &str,
    operation: &Map<String, Value>,
    warnings: &mut Vec<String>,
) -> String {
    let template_path = path_param_regex().replace_all(path, "{{ $1 }}");
    let mut url = format!("{}{}", base_url.trim_end_matches('/'), template_path);

    let mut query_params: Vec<(String, bool)> = Vec::new();
    for param in operation
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let param = resolve_ref(spec, param, warnings);
        if param.get("in").and_then(Value::as_str) != Some("query") {
            continue;
        }
        if let Some(name) = param.get("name").and_then(Value::as_str) {
            let required = param.get("required").and_then(Value::as_bool).unwrap_or(false);
            query_params.push((name.to_string(), required));
        }
    }
    if query_params.is_empty() {
        return url;
    }

    let has_required = query_params.iter().any(|(_, required)| *required);
    if has_required {
        let required_part = query_params
            .iter()
            .filter(|(_, required)| *required)
            .map(|(name, _)| format!("{}={{{{ {} }}}}", name, name))
            .collect::<Vec<_>>()
            .join("&");
        url.push('?');
        url.push_str(&required_part);
        for (name, required) in &query_params {
            if !required {
                url.push_str(&optional_query_block(name));
            }
        }
    } else {
        // All optional: every parameter is a conditional `&` block and the
        // renderer supplies the `?` only when something rendered.
        for (name, _) in &query_params {
            url.push_str(&optional_query_block(name));
        }
    }
    url
}

fn optional_query_block(name: &str) -> String {
    format!(
        "{{% if {name} is defined %}}&{name}={{{{ {name} }}}}{{% endif %}}",
        name = name
    )
}

/// Union of non-header parameters and the JSON request-body schema.
fn build_input_schema(
    spec: &Value,
    method: &str,
    operation: &Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in operation
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let param = resolve_ref(spec, param, warnings);
        // Header parameters are handled by the header templates, not the schema.
        if param.get("in").and_then(Value::as_str) == Some("header") {
            continue;
        }
        let Some(name) = param.get("name").and_then(Value::as_str) else {
            continue;
        };
        let param_schema = resolve_ref(
            spec,
            param.get("schema").unwrap_or(&Value::Null),
            warnings,
        );

        let raw_type = param_schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string");
        let mut prop = Map::new();
        prop.insert("type".into(), Value::from(normalize_type(raw_type)));
        prop.insert(
            "description".into(),
            Value::from(
                param
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Parameter: {}", name)),
            ),
        );
        for field in ["enum", "default", "minimum", "maximum", "pattern", "format"] {
            if let Some(value) = param_schema.get(field) {
                prop.insert(field.into(), value.clone());
            }
        }
        properties.insert(name.to_string(), Value::Object(prop));
        if param.get("required").and_then(Value::as_bool).unwrap_or(false)
            && !required.contains(&name.to_string())
        {
            required.push(name.to_string());
        }
    }

    if METHODS_WITH_BODY.contains(&method) {
        if let Some(schema) = body_schema(spec, operation, warnings) {
            for (prop_name, prop_schema) in schema.get("properties").and_then(Value::as_object).into_iter().flatten() {
                let resolved = resolve_ref(spec, prop_schema, warnings);
                properties.insert(prop_name.clone(), simplify_schema(resolved));
            }
            for body_required in schema
                .get("required")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                if !required.contains(&body_required.to_string()) {
                    required.push(body_required.to_string());
                }
            }
        }
    }

    let mut schema = Map::new();
    schema.insert("type".into(), Value::from("object"));
    schema.insert("properties".into(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".into(), Value::from(required));
    }
    Value::Object(schema)
}

fn body_schema<'a>(
    spec: &'a Value,
    operation: &'a Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Option<&'a Value> {
    let request_body = resolve_ref(
        spec,
        operation.get("requestBody").unwrap_or(&Value::Null),
        warnings,
    );
    let schema = request_body
        .pointer("/content/application~1json/schema")
        .unwrap_or(&Value::Null);
    let schema = resolve_ref(spec, schema, warnings);
    schema.is_object().then_some(schema)
}

/// Lowercase and map loose type spellings to JSON Schema types; unknown
/// types default to `string`.
fn normalize_type(raw_type: &str) -> String {
    let lowered = raw_type.to_lowercase();
    match lowered.as_str() {
        "str" => "string".into(),
        "int" => "integer".into(),
        "bool" => "boolean".into(),
        "float" => "number".into(),
        "dict" => "object".into(),
        "list" => "array".into(),
        _ => lowered,
    }
}

/// Flatten a schema into the shape downstream LLM tool-calling accepts:
/// arrays always carry `items`, objects always carry `properties`.
fn simplify_schema(schema: &Value) -> Value {
    let Some(schema) = schema.as_object() else {
        return json!({"type": "string"});
    };

    let mut simplified = Map::new();
    for field in ["type", "description", "enum", "default", "format", "minimum", "maximum", "pattern"] {
        if let Some(value) = schema.get(field) {
            simplified.insert(field.into(), value.clone());
        }
    }
    let normalized_type = match simplified.get("type").and_then(Value::as_str) {
        Some(raw) => normalize_type(raw),
        None => "string".into(),
    };
    simplified.insert("type".into(), Value::from(normalized_type.clone()));

    if normalized_type == "array" {
        let items = schema
            .get("items")
            .map(simplify_schema)
            .unwrap_or_else(|| json!({"type": "string"}));
        simplified.insert("items".into(), items);
    }
    if normalized_type == "object" {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), simplify_schema(v)))
                    .collect::<Map<String, Value>>()
            })
            .unwrap_or_default();
        simplified.insert("properties".into(), Value::Object(properties));
        if let Some(required) = schema.get("required") {
            simplified.insert("required".into(), required.clone());
        }
    }
    Value::Object(simplified)
}

/// Body template: the JSON-body property names, rendered conditionally at
/// call time so partial updates emit only the supplied fields.
fn build_body_template(
    spec: &Value,
    operation: &Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Option<String> {
    let schema = body_schema(spec, operation, warnings)?;
    let properties = schema.get("properties").and_then(Value::as_object)?;
    if properties.is_empty() {
        return None;
    }
    let names: Vec<&String> = properties.keys().collect();
    serde_json::to_string(&names).ok()
}

fn request_content_type(operation: &Map<String, Value>) -> String {
    let content = operation
        .get("requestBody")
        .and_then(|rb| rb.get("content"))
        .and_then(Value::as_object);
    if let Some(content) = content {
        for preferred in [
            "application/json",
            "application/x-www-form-urlencoded",
            "multipart/form-data",
        ] {
            if content.contains_key(preferred) {
                return preferred.to_string();
            }
        }
        if let Some(first) = content.keys().next() {
            return first.clone();
        }
    }
    "application/json".to_string()
}

/// Audience for token exchange: an `x-audience` extension on an OAuth2
/// security flow wins; otherwise none (the source default applies upstream).
fn extract_required_audience(spec: &Value, operation: &Map<String, Value>) -> Option<String> {
    let security = operation
        .get("security")
        .or_else(|| spec.get("security"))
        .and_then(Value::as_array)?;
    let schemes = spec.pointer("/components/securitySchemes")?.as_object()?;

    for requirement in security {
        let Some(requirement) = requirement.as_object() else {
            continue;
        };
        for scheme_name in requirement.keys() {
            let Some(scheme) = schemes.get(scheme_name) else {
                continue;
            };
            if scheme.get("type").and_then(Value::as_str) != Some("oauth2") {
                continue;
            }
            for flow in scheme
                .get("flows")
                .and_then(Value::as_object)
                .into_iter()
                .flatten()
                .map(|(_, flow)| flow)
            {
                if let Some(audience) = flow.get("x-audience").and_then(Value::as_str) {
                    return Some(audience.to_string());
                }
            }
            // OAuth2 without an explicit audience: the agent token passes
            // through unchanged.
            return None;
        }
    }
    None
}

/// Resolve a local `$ref`. External references are left unresolved with a
/// warning.
fn resolve_ref<'a>(spec: &'a Value, obj: &'a Value, warnings: &mut Vec<String>) -> &'a Value {
    let Some(ref_path) = obj.get("$ref").and_then(Value::as_str) else {
        return obj;
    };
    let Some(pointer) = ref_path.strip_prefix('#') else {
        warnings.push(format!("external $ref not resolved: {}", ref_path));
        return obj;
    };
    match spec.pointer(pointer) {
        Some(resolved) => resolved,
        None => {
            warnings.push(format!("unresolvable $ref: {}", ref_path));
            obj
        }
    }
}
