//! Handlers wiring the commands to the discovery and execution subsystems.

use crate::breaker::CircuitBreakerRegistry;
use crate::bus::commands::*;
use crate::bus::{CommandBus, CommandHandler, OperationResult};
use crate::domain::{SourceAggregate, SourceType, SourceUpdate, ToolStatus};
use crate::executor::{ExecuteToolRequest, ExecuteToolResult, ToolExecutor};
use crate::sources::{
    BuiltinSourceAdapter, InventoryReconciler, McpSourceAdapter, OpenApiSourceAdapter,
    RefreshOutcome, SourceAdapter,
};
use crate::storage::{SecretsStore, SourceRepository, ToolRepository};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// The three adapters, selected by source type.
pub struct AdapterSet {
    pub openapi: Arc<OpenApiSourceAdapter>,
    pub mcp: Arc<McpSourceAdapter>,
    pub builtin: Arc<BuiltinSourceAdapter>,
}

impl AdapterSet {
    pub fn adapter_for(&self, source_type: SourceType) -> &dyn SourceAdapter {
        match source_type {
            SourceType::Openapi => self.openapi.as_ref(),
            SourceType::Mcp => self.mcp.as_ref(),
            SourceType::Builtin => self.builtin.as_ref(),
        }
    }
}

/// One service implements every admin/execution handler; registration picks
/// the pieces apart per command type.
pub struct GatewayService {
    pub sources: Arc<dyn SourceRepository>,
    pub tools: Arc<dyn ToolRepository>,
    pub secrets: Arc<dyn SecretsStore>,
    pub adapters: Arc<AdapterSet>,
    pub reconciler: Arc<InventoryReconciler>,
    pub executor: Arc<ToolExecutor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl GatewayService {
    /// Build a bus with every handler registered.
    pub fn into_bus(self: Arc<Self>) -> CommandBus {
        let mut bus = CommandBus::new();
        bus.register::<RegisterSource>(self.clone());
        bus.register::<UpdateSource>(self.clone());
        bus.register::<DeleteSource>(self.clone());
        bus.register::<EnableSource>(self.clone());
        bus.register::<DisableSource>(self.clone());
        bus.register::<RefreshInventory>(self.clone());
        bus.register::<EnableTool>(self.clone());
        bus.register::<DisableTool>(self.clone());
        bus.register::<ResetCircuitBreaker>(self.clone());
        bus.register::<CleanupOrphanedTools>(self.clone());
        bus.register::<ExecuteTool>(self);
        bus
    }

    async fn load_source(&self, source_id: &str) -> Result<SourceAggregate, OperationResult<SourceAggregate>> {
        match self.sources.get(source_id).await {
            Ok(Some(source)) => Ok(source),
            Ok(None) => Err(OperationResult::not_found("source", source_id)),
            Err(e) => Err(OperationResult::internal_error(e.to_string())),
        }
    }
}

#[async_trait]
impl CommandHandler<RegisterSource> for GatewayService {
    async fn handle(&self, command: RegisterSource) -> OperationResult<SourceAggregate> {
        match self.sources.get(&command.id).await {
            Ok(Some(_)) => {
                return OperationResult::conflict(format!("source '{}' already exists", command.id));
            }
            Err(e) => return OperationResult::internal_error(e.to_string()),
            Ok(None) => {}
        }

        if command.validate {
            let auth_config = match self.secrets.get_auth_config(&command.id).await {
                Ok(config) => config,
                Err(e) => return OperationResult::internal_error(e.to_string()),
            };
            let adapter = self.adapters.adapter_for(command.source_type);
            let probe_url = command.spec_url.as_deref().unwrap_or(&command.url);
            if !adapter.validate_url(probe_url, auth_config.as_ref()).await {
                return OperationResult::bad_request(format!(
                    "'{}' does not point at a valid {} source",
                    probe_url,
                    match command.source_type {
                        SourceType::Openapi => "OpenAPI",
                        SourceType::Mcp => "MCP",
                        SourceType::Builtin => "builtin",
                    }
                ));
            }
        }

        let now = Utc::now();
        let (mut source, _registered) = SourceAggregate::register(
            command.id,
            command.name,
            command.url,
            command.source_type,
            command.auth_mode,
            now,
        );
        source.apply_update(
            SourceUpdate {
                spec_url: command.spec_url,
                default_audience: command.default_audience,
                required_scopes: Some(command.required_scopes),
                mcp_config: command.mcp_config,
                ..Default::default()
            },
            now,
        );

        if let Err(e) = self.sources.add(source.clone()).await {
            return OperationResult::conflict(e.to_string());
        }
        info!("registered source '{}'", source.id);
        OperationResult::ok(source)
    }
}

#[async_trait]
impl CommandHandler<UpdateSource> for GatewayService {
    async fn handle(&self, command: UpdateSource) -> OperationResult<SourceAggregate> {
        let mut source = match self.load_source(&command.source_id).await {
            Ok(source) => source,
            Err(result) => return result,
        };
        source.apply_update(command.update, Utc::now());
        if let Err(e) = self.sources.update(source.clone()).await {
            return OperationResult::internal_error(e.to_string());
        }
        OperationResult::ok(source)
    }
}

#[async_trait]
impl CommandHandler<DeleteSource> for GatewayService {
    async fn handle(&self, command: DeleteSource) -> OperationResult<usize> {
        let mut source = match self.sources.get(&command.source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return OperationResult::not_found("source", &command.source_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };

        // Cascade order: tools deprecate first, so projections never observe
        // a tool pointing at a missing source; the SourceDeleted event closes
        // the source's own stream.
        let mut events = match self.reconciler.deprecate_all(&command.source_id).await {
            Ok(events) => events,
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        let deprecated = events.len();
        events.extend(source.delete(Utc::now()));

        if let Err(e) = self.sources.remove(&command.source_id).await {
            return OperationResult::internal_error(e.to_string());
        }
        info!(
            "deleted source '{}' ({} tools deprecated, {} events)",
            command.source_id,
            deprecated,
            events.len()
        );
        OperationResult::ok(deprecated)
    }
}

#[async_trait]
impl CommandHandler<EnableSource> for GatewayService {
    async fn handle(&self, command: EnableSource) -> OperationResult<SourceAggregate> {
        let mut source = match self.load_source(&command.source_id).await {
            Ok(source) => source,
            Err(result) => return result,
        };
        source.enable(Utc::now());
        if let Err(e) = self.sources.update(source.clone()).await {
            return OperationResult::internal_error(e.to_string());
        }
        OperationResult::ok(source)
    }
}

#[async_trait]
impl CommandHandler<DisableSource> for GatewayService {
    async fn handle(&self, command: DisableSource) -> OperationResult<SourceAggregate> {
        let mut source = match self.load_source(&command.source_id).await {
            Ok(source) => source,
            Err(result) => return result,
        };
        source.disable(Utc::now());
        if let Err(e) = self.sources.update(source.clone()).await {
            return OperationResult::internal_error(e.to_string());
        }
        OperationResult::ok(source)
    }
}

#[async_trait]
impl CommandHandler<RefreshInventory> for GatewayService {
    async fn handle(&self, command: RefreshInventory) -> OperationResult<RefreshOutcome> {
        let source = match self.sources.get(&command.source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return OperationResult::not_found("source", &command.source_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        if !source.is_enabled {
            return OperationResult::bad_request(format!(
                "source '{}' is disabled",
                command.source_id
            ));
        }

        let auth_config = match self.secrets.get_auth_config(&source.id).await {
            Ok(config) => config,
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        let adapter = self.adapters.adapter_for(source.source_type);
        let url = source.spec_url.as_deref().unwrap_or(&source.url);
        let ingestion = adapter
            .fetch_and_normalize(
                url,
                auth_config.as_ref(),
                source.default_audience.as_deref(),
                source.mcp_config.as_ref(),
            )
            .await;

        match self
            .reconciler
            .reconcile(&source.id, &ingestion, command.force)
            .await
        {
            Ok((outcome, _events)) => OperationResult::ok(outcome),
            Err(e) => OperationResult::internal_error(e.to_string()),
        }
    }
}

#[async_trait]
impl CommandHandler<EnableTool> for GatewayService {
    async fn handle(&self, command: EnableTool) -> OperationResult<crate::domain::ToolAggregate> {
        let mut tool = match self.tools.get(&command.tool_id).await {
            Ok(Some(tool)) => tool,
            Ok(None) => return OperationResult::not_found("tool", &command.tool_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        tool.enable(Utc::now());
        if let Err(e) = self.tools.update(tool.clone()).await {
            return OperationResult::internal_error(e.to_string());
        }
        OperationResult::ok(tool)
    }
}

#[async_trait]
impl CommandHandler<DisableTool> for GatewayService {
    async fn handle(&self, command: DisableTool) -> OperationResult<crate::domain::ToolAggregate> {
        let mut tool = match self.tools.get(&command.tool_id).await {
            Ok(Some(tool)) => tool,
            Ok(None) => return OperationResult::not_found("tool", &command.tool_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        tool.disable(Utc::now());
        if let Err(e) = self.tools.update(tool.clone()).await {
            return OperationResult::internal_error(e.to_string());
        }
        OperationResult::ok(tool)
    }
}

#[async_trait]
impl CommandHandler<ResetCircuitBreaker> for GatewayService {
    async fn handle(&self, command: ResetCircuitBreaker) -> OperationResult<usize> {
        match command.key {
            Some(key) => match self.breakers.reset(&key).await {
                Some(()) => OperationResult::ok(1),
                None => OperationResult::not_found("circuit_breaker", &key),
            },
            None => OperationResult::ok(self.breakers.reset_all().await),
        }
    }
}

#[async_trait]
impl CommandHandler<CleanupOrphanedTools> for GatewayService {
    async fn handle(&self, command: CleanupOrphanedTools) -> OperationResult<Vec<String>> {
        let all_tools = match self.tools.list_all().await {
            Ok(tools) => tools,
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };

        let mut orphaned = Vec::new();
        for tool in all_tools {
            let source_exists = match self.sources.get(&tool.source_id).await {
                Ok(source) => source.is_some(),
                Err(e) => return OperationResult::internal_error(e.to_string()),
            };
            if !source_exists {
                orphaned.push(tool.id.clone());
                if !command.dry_run {
                    if let Err(e) = self.tools.remove(&tool.id).await {
                        return OperationResult::internal_error(e.to_string());
                    }
                }
            }
        }
        if !orphaned.is_empty() {
            info!(
                "{} {} orphaned tool(s)",
                if command.dry_run { "found" } else { "removed" },
                orphaned.len()
            );
        }
        OperationResult::ok(orphaned)
    }
}

#[async_trait]
impl CommandHandler<ExecuteTool> for GatewayService {
    async fn handle(&self, command: ExecuteTool) -> OperationResult<ExecuteToolResult> {
        let tool = match self.tools.get(&command.tool_id).await {
            Ok(Some(tool)) => tool,
            Ok(None) => return OperationResult::not_found("tool", &command.tool_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        if tool.status == ToolStatus::Deleted {
            return OperationResult::not_found("tool", &command.tool_id);
        }
        if !tool.is_enabled {
            return OperationResult::forbidden(format!("tool '{}' is disabled", command.tool_id));
        }

        let source = match self.sources.get(&tool.source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return OperationResult::not_found("source", &tool.source_id),
            Err(e) => return OperationResult::internal_error(e.to_string()),
        };
        if !source.is_enabled {
            return OperationResult::forbidden(format!("source '{}' is disabled", source.id));
        }

        let auth_config = match self.secrets.get_auth_config(&source.id).await {
            Ok(config) => config,
            Err(e) => {
                warn!("secrets store lookup failed for '{}': {}", source.id, e);
                None
            }
        };

        let result = self
            .executor
            .execute(ExecuteToolRequest {
                tool_id: tool.id.clone(),
                definition: tool.definition.clone(),
                arguments: command.arguments,
                agent_token: command.agent_token,
                source_id: source.id.clone(),
                auth_mode: source.auth_mode,
                auth_config,
                default_audience: source.default_audience.clone(),
                mcp_config: source.mcp_config.clone(),
                validate_schema: command.validate_schema,
            })
            .await;

        // Success and failure share the wire shape; the bus returns 200 with
        // the embedded status either way.
        OperationResult::ok(result)
    }
}
