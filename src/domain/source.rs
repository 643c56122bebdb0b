use crate::domain::events::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of upstream a source wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Openapi,
    Mcp,
    Builtin,
}

/// How upstream credentials are produced for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthMode {
    None,
    ApiKey,
    HttpBasic,
    ClientCredentials,
    TokenExchange,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

/// MCP transport selection for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    Stdio,
    Http,
}

/// Whether an MCP connection is torn down after each ingestion or kept open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMode {
    Transient,
    Singleton,
}

impl Default for LifecycleMode {
    fn default() -> Self {
        LifecycleMode::Transient
    }
}

/// Connection details for an MCP source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpSourceConfig {
    /// Local plugin directory holding a manifest; unset for remote servers.
    #[serde(default)]
    pub plugin_dir: Option<String>,
    /// Command override for local plugins.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment bindings resolved at spawn time. Values starting with `$`
    /// are read from the host environment; a missing one fails ingestion.
    /// `MCP_HEADER_*` keys are translated into HTTP headers for remote servers.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub server_url: Option<String>,
    pub transport: McpTransport,
    #[serde(default)]
    pub lifecycle_mode: LifecycleMode,
}

/// Persistent record of an upstream.
///
/// Never mutated directly by callers: changes flow through the methods below,
/// which mutate in-memory state and return the events to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAggregate {
    pub id: String,
    pub name: String,
    /// Base URL of the upstream.
    pub url: String,
    /// Optional override for where the OpenAPI document lives.
    #[serde(default)]
    pub spec_url: Option<String>,
    pub source_type: SourceType,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub default_audience: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub mcp_config: Option<McpSourceConfig>,
    pub health_status: HealthStatus,
    pub is_enabled: bool,
    #[serde(default)]
    pub inventory_hash: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Field set for source updates. `Option` means "not provided"; the explicit
/// `clear_*` flags distinguish "set to null" from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub spec_url: Option<String>,
    pub clear_spec_url: bool,
    pub auth_mode: Option<AuthMode>,
    pub default_audience: Option<String>,
    pub clear_default_audience: bool,
    pub required_scopes: Option<Vec<String>>,
    pub mcp_config: Option<McpSourceConfig>,
    pub clear_mcp_config: bool,
}

impl SourceAggregate {
    pub fn register(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        source_type: SourceType,
        auth_mode: AuthMode,
        now: DateTime<Utc>,
    ) -> (Self, DomainEvent) {
        let agg = Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            spec_url: None,
            source_type,
            auth_mode,
            default_audience: None,
            required_scopes: Vec::new(),
            mcp_config: None,
            health_status: HealthStatus::Unknown,
            is_enabled: true,
            inventory_hash: None,
            last_sync_at: None,
            last_sync_error: None,
            consecutive_failures: 0,
            created_at: now,
            last_modified: now,
        };
        let event = DomainEvent::SourceRegistered {
            source_id: agg.id.clone(),
            name: agg.name.clone(),
            url: agg.url.clone(),
            source_type,
            at: now,
        };
        (agg, event)
    }

    pub fn apply_update(&mut self, update: SourceUpdate, now: DateTime<Utc>) -> Vec<DomainEvent> {
        let mut changed = false;
        if let Some(name) = update.name {
            changed |= self.name != name;
            self.name = name;
        }
        if let Some(url) = update.url {
            changed |= self.url != url;
            self.url = url;
        }
        if update.clear_spec_url {
            changed |= self.spec_url.is_some();
            self.spec_url = None;
        } else if let Some(spec_url) = update.spec_url {
            changed |= self.spec_url.as_deref() != Some(spec_url.as_str());
            self.spec_url = Some(spec_url);
        }
        if let Some(auth_mode) = update.auth_mode {
            changed |= self.auth_mode != auth_mode;
            self.auth_mode = auth_mode;
        }
        if update.clear_default_audience {
            changed |= self.default_audience.is_some();
            self.default_audience = None;
        } else if let Some(audience) = update.default_audience {
            changed |= self.default_audience.as_deref() != Some(audience.as_str());
            self.default_audience = Some(audience);
        }
        if let Some(scopes) = update.required_scopes {
            changed |= self.required_scopes != scopes;
            self.required_scopes = scopes;
        }
        if update.clear_mcp_config {
            changed |= self.mcp_config.is_some();
            self.mcp_config = None;
        } else if let Some(mcp) = update.mcp_config {
            changed |= self.mcp_config.as_ref() != Some(&mcp);
            self.mcp_config = Some(mcp);
        }

        if !changed {
            return Vec::new();
        }
        self.last_modified = now;
        vec![DomainEvent::SourceUpdated {
            source_id: self.id.clone(),
            at: now,
        }]
    }

    pub fn enable(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if self.is_enabled {
            return Vec::new();
        }
        self.is_enabled = true;
        self.last_modified = now;
        vec![DomainEvent::SourceEnabled {
            source_id: self.id.clone(),
            at: now,
        }]
    }

    pub fn disable(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if !self.is_enabled {
            return Vec::new();
        }
        self.is_enabled = false;
        self.last_modified = now;
        vec![DomainEvent::SourceDisabled {
            source_id: self.id.clone(),
            at: now,
        }]
    }

    /// Record a successful inventory sync: hash, timestamp, failure reset.
    pub fn record_sync_success(
        &mut self,
        inventory_hash: impl Into<String>,
        tool_count: usize,
        now: DateTime<Utc>,
    ) -> Vec<DomainEvent> {
        let hash = inventory_hash.into();
        self.inventory_hash = Some(hash.clone());
        self.last_sync_at = Some(now);
        self.last_sync_error = None;
        self.consecutive_failures = 0;
        self.health_status = HealthStatus::Healthy;
        self.last_modified = now;
        vec![DomainEvent::SourceSyncSucceeded {
            source_id: self.id.clone(),
            inventory_hash: hash,
            tool_count,
            at: now,
        }]
    }

    /// Terminal removal. The caller drops the aggregate from the store
    /// afterwards; the event is what lets projections observe the deletion.
    pub fn delete(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        self.is_enabled = false;
        self.last_modified = now;
        vec![DomainEvent::SourceDeleted {
            source_id: self.id.clone(),
            at: now,
        }]
    }

    /// Record a failed sync without touching any tool state.
    pub fn record_sync_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Vec<DomainEvent> {
        let error = error.into();
        self.consecutive_failures += 1;
        self.last_sync_error = Some(error.clone());
        self.health_status = if self.consecutive_failures >= 3 {
            HealthStatus::Unreachable
        } else {
            HealthStatus::Degraded
        };
        self.last_modified = now;
        vec![DomainEvent::SourceSyncFailed {
            source_id: self.id.clone(),
            error,
            consecutive_failures: self.consecutive_failures,
            at: now,
        }]
    }
}
