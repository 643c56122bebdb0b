//! Built-in tool runtime: utility tools executed in-process, scoped to the
//! calling user.
//!
//! Built-ins are registered like any other source (see
//! `sources::builtin`) and short-circuited by the executor — no token, no
//! HTTP proxy.

pub mod code;
pub mod fetch;
pub mod files;
pub mod human;
pub mod memory;
pub mod spreadsheet;
pub mod utility;
pub mod workspace;

pub use crate::auth::UserContext;

use crate::config::BuiltinSettings;
use crate::domain::{ExecutionMode, ExecutionProfile, ToolDefinition};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Uniform result shape for every built-in tool.
#[derive(Debug, Clone, Default)]
pub struct BuiltinToolResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl BuiltinToolResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn ok_with_metadata(result: Value, metadata: Map<String, Value>) -> Self {
        Self {
            success: true,
            result: Some(result),
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One built-in tool. `user` scopes filesystem and memory operations.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult;
}

/// Lookup from tool name to implementation.
pub struct BuiltinRegistry {
    tools: HashMap<String, Arc<dyn BuiltinTool>>,
}

impl BuiltinRegistry {
    /// The standard catalogue.
    pub fn standard(settings: &BuiltinSettings) -> Arc<Self> {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        let workspace = Arc::new(workspace::Workspace::new(settings));

        registry.register(Arc::new(fetch::FetchUrlTool::new(settings, workspace.clone())));
        registry.register(Arc::new(utility::CurrentDatetimeTool));
        registry.register(Arc::new(utility::CalculateTool));
        registry.register(Arc::new(utility::GenerateUuidTool));
        registry.register(Arc::new(utility::EncodeDecodeTool));
        registry.register(Arc::new(utility::RegexExtractTool));
        registry.register(Arc::new(utility::JsonTransformTool));
        registry.register(Arc::new(utility::TextStatsTool));
        registry.register(Arc::new(files::FileWriterTool::new(settings, workspace.clone())));
        registry.register(Arc::new(files::FileReaderTool::new(workspace.clone())));
        registry.register(Arc::new(spreadsheet::SpreadsheetReadTool::new(workspace.clone())));
        registry.register(Arc::new(spreadsheet::SpreadsheetWriteTool::new(workspace.clone())));
        let memory_store = Arc::new(memory::MemoryStore::new(settings, workspace.clone()));
        registry.register(Arc::new(memory::MemoryStoreTool::new(memory_store.clone())));
        registry.register(Arc::new(memory::MemoryRetrieveTool::new(memory_store)));
        registry.register(Arc::new(code::ExecutePythonTool::new(settings)));
        registry.register(Arc::new(human::AskHumanTool));

        info!("builtin registry initialized with {} tools", registry.tools.len());
        Arc::new(registry)
    }

    fn register(&mut self, tool: Arc<dyn BuiltinTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinTool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        user: &UserContext,
    ) -> BuiltinToolResult {
        let Some(tool) = self.get(name) else {
            return BuiltinToolResult::err(format!("unknown builtin tool '{}'", name));
        };
        debug!("executing builtin '{}' for user '{}'", name, user.user_id);
        tool.execute(arguments, user).await
    }

    /// Normalized definitions for the catalogue, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
                source_path: format!("builtin://{}", tool.name()),
                tags: vec!["builtin".to_string()],
                deprecated: false,
                execution_profile: ExecutionProfile {
                    mode: ExecutionMode::Builtin,
                    method: "LOCAL".to_string(),
                    url_template: format!("builtin://{}", tool.name()),
                    content_type: "application/json".to_string(),
                    ..Default::default()
                },
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Read a required string argument.
pub(crate) fn required_str<'a>(
    arguments: &'a Map<String, Value>,
    name: &str,
) -> Result<&'a str, String> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument '{}'", name))
}

pub(crate) fn optional_str<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}

pub(crate) fn optional_u64(arguments: &Map<String, Value>, name: &str) -> Option<u64> {
    arguments.get(name).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standard_catalogue_is_complete() {
        let registry = BuiltinRegistry::standard(&BuiltinSettings::default());
        let names: Vec<String> = registry
            .definitions()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        for expected in [
            "ask_human",
            "calculate",
            "encode_decode",
            "execute_python",
            "fetch_url",
            "file_reader",
            "file_writer",
            "generate_uuid",
            "get_current_datetime",
            "json_transform",
            "memory_retrieve",
            "memory_store",
            "regex_extract",
            "spreadsheet_read",
            "spreadsheet_write",
            "text_stats",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[tokio::test]
    async fn definitions_carry_builtin_scheme() {
        let registry = BuiltinRegistry::standard(&BuiltinSettings::default());
        for def in registry.definitions() {
            assert!(def.is_builtin(), "{} must use the builtin scheme", def.name);
            assert_eq!(def.execution_profile.mode, ExecutionMode::Builtin);
            assert!(def.input_schema.get("properties").is_some());
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let registry = BuiltinRegistry::standard(&BuiltinSettings::default());
        let result = registry
            .execute("no_such_tool", &Map::new(), &UserContext::anonymous())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no_such_tool"));
    }
}
