//! Typed commands accepted by the bus.

use crate::bus::Command;
use crate::domain::{AuthMode, McpSourceConfig, SourceAggregate, SourceType, SourceUpdate, ToolAggregate};
use crate::executor::ExecuteToolResult;
use crate::sources::RefreshOutcome;
use serde_json::{Map, Value};

/// Register a new upstream source.
pub struct RegisterSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub spec_url: Option<String>,
    pub source_type: SourceType,
    pub auth_mode: AuthMode,
    pub default_audience: Option<String>,
    pub required_scopes: Vec<String>,
    pub mcp_config: Option<McpSourceConfig>,
    /// Probe the URL before registering.
    pub validate: bool,
}

impl Command for RegisterSource {
    type Output = SourceAggregate;
}

pub struct UpdateSource {
    pub source_id: String,
    pub update: SourceUpdate,
}

impl Command for UpdateSource {
    type Output = SourceAggregate;
}

/// Delete a source. Its tools are deprecated first (never silently
/// deleted), then the aggregate is removed.
pub struct DeleteSource {
    pub source_id: String,
}

impl Command for DeleteSource {
    type Output = usize;
}

pub struct EnableSource {
    pub source_id: String,
}

impl Command for EnableSource {
    type Output = SourceAggregate;
}

pub struct DisableSource {
    pub source_id: String,
}

impl Command for DisableSource {
    type Output = SourceAggregate;
}

/// Re-ingest a source and reconcile the inventory.
pub struct RefreshInventory {
    pub source_id: String,
    pub force: bool,
}

impl Command for RefreshInventory {
    type Output = RefreshOutcome;
}

pub struct EnableTool {
    pub tool_id: String,
}

impl Command for EnableTool {
    type Output = ToolAggregate;
}

pub struct DisableTool {
    pub tool_id: String,
}

impl Command for DisableTool {
    type Output = ToolAggregate;
}

/// Reset one circuit breaker by key, or all of them.
pub struct ResetCircuitBreaker {
    pub key: Option<String>,
}

impl Command for ResetCircuitBreaker {
    type Output = usize;
}

/// Remove tool aggregates whose source no longer exists.
pub struct CleanupOrphanedTools {
    pub dry_run: bool,
}

impl Command for CleanupOrphanedTools {
    type Output = Vec<String>;
}

/// Execute one tool invocation on behalf of an agent.
pub struct ExecuteTool {
    pub tool_id: String,
    pub arguments: Map<String, Value>,
    pub agent_token: String,
    pub validate_schema: Option<bool>,
}

impl Command for ExecuteTool {
    type Output = ExecuteToolResult;
}
