use crate::domain::{
    AuthConfig, ExecutionMode, ExecutionProfile, LifecycleMode, McpSourceConfig, McpTransport,
    SourceType, ToolDefinition,
};
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use crate::sources::{IngestionResult, SourceAdapter};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use rmcp::transport::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const HEADER_ENV_PREFIX: &str = "MCP_HEADER_";
const MANIFEST_FILE: &str = "server.json";

/// Plugin manifest (`server.json`) describing how to start a local MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

impl McpManifest {
    pub fn load(plugin_dir: &Path) -> anyhow::Result<Self> {
        let path = plugin_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        let manifest: McpManifest = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid manifest {}: {}", path.display(), e))?;
        if manifest.command.is_empty() {
            anyhow::bail!("manifest {} declares no command", path.display());
        }
        Ok(manifest)
    }
}

/// Discovers tools from MCP servers, local (stdio child process) or remote
/// (streamable HTTP), and proxies `MCP_CALL` invocations for the executor.
pub struct McpSourceAdapter {
    /// Connections kept open for `lifecycle_mode = SINGLETON`, keyed by
    /// plugin dir or server URL.
    connections: Mutex<HashMap<String, RunningService<RoleClient, ()>>>,
}

impl Default for McpSourceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl McpSourceAdapter {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(
        &self,
        config: &McpSourceConfig,
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<RunningService<RoleClient, ()>> {
        match config.transport {
            McpTransport::Stdio => {
                let plugin_dir = config
                    .plugin_dir
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("stdio MCP source requires plugin_dir"))?;
                let plugin_path = Path::new(plugin_dir);
                let (program, args) = match &config.command {
                    Some(command) => (command.clone(), config.args.clone()),
                    None => {
                        let manifest = McpManifest::load(plugin_path)?;
                        let mut command = manifest.command;
                        let program = command.remove(0);
                        (program, command)
                    }
                };

                let mut cmd = Command::new(&program);
                cmd.args(&args);
                cmd.current_dir(plugin_path);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd.stdin(std::process::Stdio::piped());
                cmd.stdout(std::process::Stdio::piped());
                cmd.stderr(std::process::Stdio::inherit());

                let transport = TokioChildProcess::new(cmd)?;
                let client = ().serve(transport).await.map_err(|e| {
                    anyhow::anyhow!("MCP handshake failed for plugin '{}': {}", plugin_dir, e)
                })?;
                Ok(client)
            }
            McpTransport::Http => {
                let server_url = config
                    .server_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("http MCP source requires server_url"))?;

                let mut default_headers = reqwest::header::HeaderMap::new();
                for (name, value) in header_env_to_headers(env) {
                    let header_name: reqwest::header::HeaderName = name.parse()?;
                    default_headers.insert(header_name, value.parse()?);
                }
                let http = reqwest::Client::builder()
                    .default_headers(default_headers)
                    .build()?;

                let transport = rmcp::transport::StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(server_url.to_string()),
                );
                let client = ().serve(transport).await.map_err(|e| {
                    anyhow::anyhow!("MCP handshake failed for server '{}': {}", server_url, e)
                })?;
                Ok(client)
            }
        }
    }

    async fn acquire(
        &self,
        config: &McpSourceConfig,
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<(rmcp::service::Peer<RoleClient>, Option<RunningService<RoleClient, ()>>)>
    {
        let key = connection_key(config);
        if config.lifecycle_mode == LifecycleMode::Singleton {
            let mut connections = self.connections.lock().await;
            if let Some(existing) = connections.get(&key) {
                return Ok((existing.peer().clone(), None));
            }
            let client = self.connect(config, env).await?;
            let peer = client.peer().clone();
            connections.insert(key, client);
            return Ok((peer, None));
        }
        let client = self.connect(config, env).await?;
        Ok((client.peer().clone(), Some(client)))
    }

    /// Execute one tool on the MCP server for the executor's `MCP_CALL` mode.
    pub async fn call_tool(
        &self,
        config: &McpSourceConfig,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> ToolgateResult<Value> {
        let env = resolve_environment(config).map_err(|missing| {
            missing_env_error(&missing)
        })?;
        let (peer, transient) = self.acquire(config, &env).await.map_err(|e| {
            ToolgateError::new(
                ErrorKind::UpstreamConnectionError,
                format!("MCP connection failed: {}", e),
            )
        })?;

        let request = CallToolRequestParams::new(Cow::Owned(tool_name.to_string()))
            .with_arguments(arguments);
        let result = peer.call_tool(request).await;

        if let Some(client) = transient {
            if let Err(e) = client.cancel().await {
                warn!("error closing transient MCP connection: {}", e);
            }
        }

        let result = result.map_err(|e| {
            ToolgateError::new(
                ErrorKind::UpstreamError,
                format!("MCP tool '{}' call failed: {}", tool_name, e),
            )
        })?;

        let output = flatten_content(&result.content);
        if result.is_error.unwrap_or(false) {
            return Err(ToolgateError::new(
                ErrorKind::UpstreamError,
                format!("MCP tool '{}' reported an error", tool_name),
            )
            .with_retryable(false)
            .with_upstream_body(&output));
        }
        // Prefer structured JSON when the server returned it as text.
        Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
    }

    /// Close every singleton connection.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        for (key, client) in connections.drain() {
            if let Err(e) = client.cancel().await {
                warn!("error shutting down MCP connection '{}': {}", key, e);
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for McpSourceAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Mcp
    }

    async fn fetch_and_normalize(
        &self,
        _url: &str,
        _auth_config: Option<&AuthConfig>,
        _default_audience: Option<&str>,
        mcp_config: Option<&McpSourceConfig>,
    ) -> IngestionResult {
        let Some(config) = mcp_config else {
            return IngestionResult::failure("mcp_config is required for MCP sources");
        };
        match config.transport {
            McpTransport::Http => {
                info!("discovering tools from remote MCP server: {:?}", config.server_url)
            }
            McpTransport::Stdio => {
                info!("discovering tools from MCP plugin: {:?}", config.plugin_dir)
            }
        }

        let env = match resolve_environment(config) {
            Ok(env) => env,
            Err(missing) => {
                return IngestionResult::failure(format!(
                    "missing required environment variables: {}",
                    missing.join(", ")
                ));
            }
        };

        // Best-effort version from the local manifest.
        let source_version = config
            .plugin_dir
            .as_deref()
            .and_then(|dir| McpManifest::load(Path::new(dir)).ok())
            .and_then(|m| m.version);

        let (peer, transient) = match self.acquire(config, &env).await {
            Ok(acquired) => acquired,
            Err(e) => return IngestionResult::failure(format!("MCP transport error: {}", e)),
        };

        let listed = peer.list_all_tools().await;
        if let Some(client) = transient {
            if let Err(e) = client.cancel().await {
                warn!("error closing transient MCP connection: {}", e);
            }
        }

        match listed {
            Ok(mcp_tools) => {
                debug!("discovered {} tools from MCP server", mcp_tools.len());
                let tools = mcp_tools
                    .into_iter()
                    .map(|tool| convert_mcp_tool(&tool, config))
                    .collect();
                IngestionResult::ok(tools, source_version, Vec::new())
            }
            Err(e) => IngestionResult::failure(format!("MCP tools/list failed: {}", e)),
        }
    }

    async fn validate_url(&self, url: &str, _auth_config: Option<&AuthConfig>) -> bool {
        if url.starts_with("http://") || url.starts_with("https://") {
            // Remote servers are validated by the actual handshake at refresh
            // time; registration only checks the URL shape.
            return url::Url::parse(url).is_ok();
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        McpManifest::load(Path::new(path)).is_ok()
    }
}

fn connection_key(config: &McpSourceConfig) -> String {
    config
        .server_url
        .clone()
        .or_else(|| config.plugin_dir.clone())
        .unwrap_or_default()
}

/// Resolve the configured environment. Values starting with `$` are read
/// from the host environment; a missing one fails ingestion with the list
/// of missing names.
fn resolve_environment(config: &McpSourceConfig) -> Result<BTreeMap<String, String>, Vec<String>> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();
    for (key, value) in &config.env {
        if let Some(var_name) = value.strip_prefix('$') {
            match std::env::var(var_name) {
                Ok(host_value) => {
                    resolved.insert(key.clone(), host_value);
                }
                Err(_) => missing.push(var_name.to_string()),
            }
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }
    if missing.is_empty() { Ok(resolved) } else { Err(missing) }
}

fn missing_env_error(missing: &[String]) -> ToolgateError {
    ToolgateError::new(
        ErrorKind::InternalError,
        format!(
            "missing required environment variables: {}",
            missing.join(", ")
        ),
    )
    .with_retryable(false)
}

/// `MCP_HEADER_X_FOO_BAR=v` becomes header `X-Foo-Bar: v`.
fn header_env_to_headers(env: &BTreeMap<String, String>) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(HEADER_ENV_PREFIX).map(|raw| {
                let name = raw
                    .split('_')
                    .filter(|segment| !segment.is_empty())
                    .map(|segment| {
                        let mut chars = segment.chars();
                        match chars.next() {
                            Some(first) => {
                                first.to_ascii_uppercase().to_string()
                                    + &chars.as_str().to_ascii_lowercase()
                            }
                            None => String::new(),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("-");
                (name, value.clone())
            })
        })
        .collect()
}

fn convert_mcp_tool(tool: &rmcp::model::Tool, config: &McpSourceConfig) -> ToolDefinition {
    let name = tool.name.to_string();
    let description = tool
        .description
        .as_deref()
        .unwrap_or_default()
        .to_string();
    let input_schema = Value::Object((*tool.input_schema).clone());

    let location = connection_key(config);
    ToolDefinition {
        name: name.clone(),
        description,
        input_schema,
        source_path: format!("mcp://{}#{}", location, name),
        tags: vec!["mcp".to_string()],
        deprecated: false,
        execution_profile: ExecutionProfile {
            mode: ExecutionMode::McpCall,
            method: "MCP".to_string(),
            url_template: format!("mcp://{}", name),
            content_type: "application/json".to_string(),
            ..Default::default()
        },
    }
}

fn flatten_content(content: &[rmcp::model::Content]) -> String {
    let mut output = String::new();
    for block in content {
        if !output.is_empty() {
            output.push('\n');
        }
        match &block.raw {
            RawContent::Text(text) => output.push_str(&text.text),
            RawContent::Image(img) => {
                output.push_str(&format!("[image: {} ({} bytes)]", img.mime_type, img.data.len()));
            }
            _ => output.push_str("[unsupported MCP content type]"),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(env: &[(&str, &str)]) -> McpSourceConfig {
        McpSourceConfig {
            plugin_dir: Some("/opt/plugins/demo".into()),
            command: None,
            args: Vec::new(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            server_url: None,
            transport: McpTransport::Stdio,
            lifecycle_mode: LifecycleMode::Transient,
        }
    }

    #[test]
    fn literal_env_values_pass_through() {
        let resolved = resolve_environment(&config(&[("API_MODE", "test")])).unwrap();
        assert_eq!(resolved["API_MODE"], "test");
    }

    #[test]
    fn missing_host_env_vars_are_listed() {
        let missing = resolve_environment(&config(&[
            ("TOKEN", "$TOOLGATE_TEST_UNSET_VAR_A"),
            ("KEY", "$TOOLGATE_TEST_UNSET_VAR_B"),
        ]))
        .unwrap_err();
        assert_eq!(
            missing,
            vec!["TOOLGATE_TEST_UNSET_VAR_A", "TOOLGATE_TEST_UNSET_VAR_B"]
        );
    }

    #[test]
    fn header_env_vars_become_http_headers() {
        let env: BTreeMap<String, String> = [
            ("MCP_HEADER_X_FOO_BAR".to_string(), "v1".to_string()),
            ("MCP_HEADER_AUTHORIZATION".to_string(), "Bearer x".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ]
        .into_iter()
        .collect();
        let mut headers = header_env_to_headers(&env);
        headers.sort();
        assert_eq!(
            headers,
            vec![
                ("Authorization".to_string(), "Bearer x".to_string()),
                ("X-Foo-Bar".to_string(), "v1".to_string()),
            ]
        );
    }

    #[test]
    fn manifest_load_requires_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name": "demo", "version": "0.3.0", "command": ["python", "server.py"]}"#,
        )
        .unwrap();
        let manifest = McpManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.version.as_deref(), Some("0.3.0"));
        assert_eq!(manifest.command, vec!["python", "server.py"]);

        std::fs::write(dir.path().join(MANIFEST_FILE), r#"{"command": []}"#).unwrap();
        assert!(McpManifest::load(dir.path()).is_err());
    }

    #[tokio::test]
    async fn missing_mcp_config_fails_ingestion() {
        let adapter = McpSourceAdapter::new();
        let result = adapter
            .fetch_and_normalize("file:///opt/plugins/demo", None, None, None)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("mcp_config"));
    }

    #[tokio::test]
    async fn missing_env_fails_before_any_connection() {
        let adapter = McpSourceAdapter::new();
        let cfg = config(&[("TOKEN", "$TOOLGATE_TEST_UNSET_VAR_C")]);
        let result = adapter
            .fetch_and_normalize("file:///opt/plugins/demo", None, None, Some(&cfg))
            .await;
        assert!(!result.success);
        assert!(
            result
                .error
                .unwrap()
                .contains("TOOLGATE_TEST_UNSET_VAR_C")
        );
    }

    #[tokio::test]
    async fn validate_url_checks_manifest_for_local_plugins() {
        let adapter = McpSourceAdapter::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(!adapter.validate_url(dir.path().to_str().unwrap(), None).await);
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"command": ["node", "index.js"]}"#,
        )
        .unwrap();
        assert!(adapter.validate_url(dir.path().to_str().unwrap(), None).await);
        assert!(adapter.validate_url("https://mcp.example.com/server", None).await);
    }
}
