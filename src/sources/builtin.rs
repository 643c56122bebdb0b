use crate::builtins::BuiltinRegistry;
use crate::domain::{AuthConfig, McpSourceConfig, SourceType};
use crate::sources::{IngestionResult, SourceAdapter};
use async_trait::async_trait;
use std::sync::Arc;

/// Adapter exposing the built-in catalogue as a source.
///
/// Built-ins follow the same registration, policy, and audit model as
/// external tools; only execution short-circuits to the local runtime.
pub struct BuiltinSourceAdapter {
    registry: Arc<BuiltinRegistry>,
}

impl BuiltinSourceAdapter {
    pub fn new(registry: Arc<BuiltinRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SourceAdapter for BuiltinSourceAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Builtin
    }

    async fn fetch_and_normalize(
        &self,
        _url: &str,
        _auth_config: Option<&AuthConfig>,
        _default_audience: Option<&str>,
        _mcp_config: Option<&McpSourceConfig>,
    ) -> IngestionResult {
        IngestionResult::ok(
            self.registry.definitions(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            Vec::new(),
        )
    }

    async fn validate_url(&self, _url: &str, _auth_config: Option<&AuthConfig>) -> bool {
        true
    }
}
