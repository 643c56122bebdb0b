use crate::builtins::workspace::Workspace;
use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, required_str};
use crate::config::BuiltinSettings;
use crate::utils::http::{FetchedBody, read_classified};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// HTTP GET with size and timeout caps. Text and JSON come back inline;
/// binary bodies are saved to the user's workspace and returned as a
/// download reference.
pub struct FetchUrlTool {
    http: reqwest::Client,
    max_bytes: usize,
    workspace: Arc<Workspace>,
}

impl FetchUrlTool {
    pub fn new(settings: &BuiltinSettings, workspace: Arc<Workspace>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            max_bytes: settings.fetch_max_bytes,
            workspace,
        }
    }

    async fn fetch(&self, url: &str, user: &UserContext) -> anyhow::Result<BuiltinToolResult> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(BuiltinToolResult::err("only http and https URLs are supported"));
        }

        let response = self.http.get(url).send().await?;
        let fetched = read_classified(response, self.max_bytes).await?;

        let mut metadata = Map::new();
        metadata.insert("status".into(), json!(fetched.status));
        metadata.insert("content_type".into(), json!(fetched.content_type));
        metadata.insert("size_bytes".into(), json!(fetched.size_bytes));
        if fetched.truncated {
            metadata.insert("truncated".into(), json!(true));
        }

        match fetched.body {
            FetchedBody::Json(value) => Ok(BuiltinToolResult::ok_with_metadata(value, metadata)),
            FetchedBody::Text(text) => {
                Ok(BuiltinToolResult::ok_with_metadata(Value::String(text), metadata))
            }
            FetchedBody::Binary(bytes) => {
                // Park it in the workspace and hand back a reference.
                let filename = format!("download-{}", Uuid::new_v4());
                let path = self.workspace.resolve_file(&user.user_id, &filename)?;
                tokio::fs::write(&path, &bytes).await?;
                debug!("saved binary fetch ({} bytes) to {:?}", bytes.len(), path);
                Ok(BuiltinToolResult::ok_with_metadata(
                    json!({
                        "download": filename,
                        "content_type": fetched.content_type,
                        "size_bytes": bytes.len(),
                    }),
                    metadata,
                ))
            }
        }
    }
}

#[async_trait]
impl BuiltinTool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch content from an HTTP(S) URL. Text and JSON are returned inline; binary content is saved to the workspace and returned as a download reference."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        let url = match required_str(arguments, "url") {
            Ok(url) => url,
            Err(e) => return BuiltinToolResult::err(e),
        };
        match self.fetch(url, user).await {
            Ok(result) => result,
            Err(e) => BuiltinToolResult::err(format!("fetch failed: {}", e)),
        }
    }
}
