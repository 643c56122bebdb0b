use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How a tool invocation reaches its implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    SyncHttp,
    AsyncPoll,
    McpCall,
    Builtin,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::SyncHttp
    }
}

/// Async completion polling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub status_url_template: String,
    pub status_field_path: String,
    #[serde(default)]
    pub result_field_path: Option<String>,
    pub completed_values: Vec<String>,
    pub failed_values: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: f64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_poll_attempts: u32,
}

fn default_poll_interval() -> f64 {
    2.0
}

fn default_max_interval() -> f64 {
    30.0
}

fn default_backoff() -> f64 {
    1.5
}

fn default_max_attempts() -> u32 {
    60
}

/// How to invoke a tool: transport, templates, credentials, timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_method")]
    pub method: String,
    pub url_template: String,
    /// Header name → template string.
    #[serde(default)]
    pub headers_template: BTreeMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Audience hint for token exchange; empty means pass the agent token through.
    #[serde(default)]
    pub required_audience: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub poll_config: Option<PollConfig>,
    /// Output field → dotted path into the upstream response.
    #[serde(default)]
    pub response_mapping: Option<BTreeMap<String, String>>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            method: default_method(),
            url_template: String::new(),
            headers_template: BTreeMap::new(),
            body_template: None,
            content_type: default_content_type(),
            required_audience: None,
            required_scopes: Vec::new(),
            timeout_seconds: None,
            poll_config: None,
            response_mapping: None,
        }
    }
}

/// The normalized shape for any callable, regardless of where it came from.
///
/// `name` is stable across refreshes and keys the aggregate as
/// `source_id:name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema object; valid even when empty (`{"type":"object",...}`).
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    /// Original path on the upstream, kept for audit.
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub execution_profile: ExecutionProfile,
}

fn empty_object_schema() -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from("object"));
    obj.insert("properties".into(), Value::Object(Map::new()));
    Value::Object(obj)
}

impl Default for ToolDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            // An empty tool still carries a valid (vacuous) object schema.
            input_schema: empty_object_schema(),
            source_path: String::new(),
            tags: Vec::new(),
            deprecated: false,
            execution_profile: ExecutionProfile::default(),
        }
    }
}

impl ToolDefinition {
    /// Scheme marking a tool as implemented by the built-in runtime.
    pub const BUILTIN_SCHEME: &'static str = "builtin://";

    pub fn is_builtin(&self) -> bool {
        self.execution_profile
            .url_template
            .starts_with(Self::BUILTIN_SCHEME)
    }

    /// Property names declared in `input_schema.properties`, in schema order.
    pub fn property_names(&self) -> Vec<String> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Required property names from `input_schema.required`.
    pub fn required_names(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|req| {
                req.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_input_schema_is_valid_object() {
        let def = ToolDefinition {
            name: "noop".into(),
            input_schema: empty_object_schema(),
            ..Default::default()
        };
        assert_eq!(def.input_schema["type"], "object");
        assert!(def.property_names().is_empty());
        assert!(def.required_names().is_empty());
    }

    #[test]
    fn builtin_detection_uses_url_scheme() {
        let mut def = ToolDefinition::default();
        def.execution_profile.url_template = "builtin://current_time".into();
        assert!(def.is_builtin());
        def.execution_profile.url_template = "https://api.example.com/x".into();
        assert!(!def.is_builtin());
    }

    #[test]
    fn property_and_required_names_read_schema() {
        let def = ToolDefinition {
            name: "create_user".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"email": {"type": "string"}, "age": {"type": "integer"}},
                "required": ["email"]
            }),
            ..Default::default()
        };
        assert!(def.property_names().contains(&"email".to_string()));
        assert_eq!(def.required_names(), vec!["email"]);
    }

    #[test]
    fn execution_mode_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ExecutionMode::AsyncPoll).unwrap(),
            "\"ASYNC_POLL\""
        );
        assert_eq!(
            serde_json::from_str::<ExecutionMode>("\"MCP_CALL\"").unwrap(),
            ExecutionMode::McpCall
        );
    }
}
