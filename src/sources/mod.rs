//! Source ingestion: adapters that turn heterogeneous upstreams into the
//! normalized tool catalogue, plus the reconciler that diffs discoveries
//! against persisted state.

pub mod builtin;
pub mod mcp;
pub mod openapi;
pub mod reconciler;

pub use builtin::BuiltinSourceAdapter;
pub use mcp::McpSourceAdapter;
pub use openapi::OpenApiSourceAdapter;
pub use reconciler::{InventoryReconciler, RefreshOutcome};

use crate::domain::{AuthConfig, McpSourceConfig, SourceType, ToolDefinition};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Result of one ingestion pass over a source.
#[derive(Debug, Clone, Default)]
pub struct IngestionResult {
    pub tools: Vec<ToolDefinition>,
    pub inventory_hash: String,
    pub success: bool,
    pub error: Option<String>,
    pub source_version: Option<String>,
    pub warnings: Vec<String>,
}

impl IngestionResult {
    pub fn ok(tools: Vec<ToolDefinition>, source_version: Option<String>, warnings: Vec<String>) -> Self {
        let inventory_hash = inventory_hash(&tools);
        Self {
            tools,
            inventory_hash,
            success: true,
            error: None,
            source_version,
            warnings,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A source adapter ingests one kind of upstream.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Fetch the upstream, normalize every operation to a [`ToolDefinition`],
    /// and compute the inventory hash. Failures are reported in the result,
    /// not as errors — the reconciler records them on the source aggregate.
    async fn fetch_and_normalize(
        &self,
        url: &str,
        auth_config: Option<&AuthConfig>,
        default_audience: Option<&str>,
        mcp_config: Option<&McpSourceConfig>,
    ) -> IngestionResult;

    /// Cheap reachability/shape check used by the register command.
    async fn validate_url(&self, url: &str, auth_config: Option<&AuthConfig>) -> bool;
}

/// Canonical digest of a tool set: SHA-256 over the canonical JSON of the
/// name-sorted definitions, truncated to 16 hex chars. Identical upstream
/// content always produces the same hash.
pub fn inventory_hash(tools: &[ToolDefinition]) -> String {
    let mut sorted: Vec<&ToolDefinition> = tools.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for tool in sorted {
        let value = serde_json::to_value(tool).unwrap_or(Value::Null);
        hasher.update(canonical_json(&value));
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Canonical JSON with object keys sorted recursively, so hashing is stable
/// regardless of key insertion order.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_order_independent() {
        let a = vec![tool("alpha", "a"), tool("beta", "b")];
        let b = vec![tool("beta", "b"), tool("alpha", "a")];
        assert_eq!(inventory_hash(&a), inventory_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = vec![tool("alpha", "a")];
        let b = vec![tool("alpha", "changed")];
        assert_ne!(inventory_hash(&a), inventory_hash(&b));
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let hash = inventory_hash(&[tool("alpha", "a")]);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn failure_result_has_no_hash() {
        let result = IngestionResult::failure("connect refused");
        assert!(!result.success);
        assert!(result.inventory_hash.is_empty());
        assert_eq!(result.error.as_deref(), Some("connect refused"));
    }
}
