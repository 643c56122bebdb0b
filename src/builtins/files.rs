use crate::builtins::workspace::{BINARY_EXTENSIONS, TEXT_EXTENSIONS, Workspace, extension};
use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, optional_str, required_str};
use crate::config::BuiltinSettings;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Write a file into the user's workspace.
///
/// Text content is written as-is when the extension is on the text
/// allow-list. Binary content must arrive base64-encoded with an extension
/// on the binary allow-list. Everything is capped at the configured size.
pub struct FileWriterTool {
    workspace: Arc<Workspace>,
    max_bytes: usize,
}

impl FileWriterTool {
    pub fn new(settings: &BuiltinSettings, workspace: Arc<Workspace>) -> Self {
        Self {
            workspace,
            max_bytes: settings.file_max_bytes,
        }
    }

    async fn write(&self, arguments: &Map<String, Value>, user: &UserContext) -> Result<Value, String> {
        let filename = required_str(arguments, "filename")?;
        let content = required_str(arguments, "content")?;
        let is_binary = arguments
            .get("binary")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let ext = extension(filename).ok_or("filename must have an extension")?;
        let bytes: Vec<u8> = if is_binary {
            if !BINARY_EXTENSIONS.contains(&ext.as_str()) {
                return Err(format!("extension '.{}' is not on the binary allow-list", ext));
            }
            BASE64
                .decode(content.as_bytes())
                .map_err(|e| format!("binary content must be valid base64: {}", e))?
        } else {
            if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
                return Err(format!("extension '.{}' is not on the text allow-list", ext));
            }
            content.as_bytes().to_vec()
        };

        if bytes.len() > self.max_bytes {
            return Err(format!(
                "content is {} bytes; the limit is {}",
                bytes.len(),
                self.max_bytes
            ));
        }

        let path = self
            .workspace
            .resolve_file(&user.user_id, filename)
            .map_err(|e| e.to_string())?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| format!("write failed: {}", e))?;

        Ok(json!({
            "filename": filename,
            "size_bytes": bytes.len(),
            "binary": is_binary,
        }))
    }
}

#[async_trait]
impl BuiltinTool for FileWriterTool {
    fn name(&self) -> &str {
        "file_writer"
    }

    fn description(&self) -> &str {
        "Write a file to the user workspace. Binary content must be base64-encoded with binary=true."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string"},
                "content": {"type": "string"},
                "binary": {"type": "boolean", "description": "Content is base64-encoded binary"}
            },
            "required": ["filename", "content"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        match self.write(arguments, user).await {
            Ok(result) => BuiltinToolResult::ok(result),
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}

/// Read a file from the user's workspace.
pub struct FileReaderTool {
    workspace: Arc<Workspace>,
}

impl FileReaderTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }

    async fn read(&self, arguments: &Map<String, Value>, user: &UserContext) -> Result<Value, String> {
        let filename = required_str(arguments, "filename")?;
        let as_base64 = optional_str(arguments, "encoding") == Some("base64");

        let path = self
            .workspace
            .resolve_file(&user.user_id, filename)
            .map_err(|e| e.to_string())?;
        if !path.is_file() {
            return Err(format!("file '{}' not found in workspace", filename));
        }
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| format!("read failed: {}", e))?;

        let content = if as_base64 {
            Value::String(BASE64.encode(&bytes))
        } else {
            match String::from_utf8(bytes.clone()) {
                Ok(text) => Value::String(text),
                Err(_) => {
                    return Err(format!(
                        "file '{}' is not valid UTF-8; request encoding=base64",
                        filename
                    ));
                }
            }
        };

        Ok(json!({
            "filename": filename,
            "size_bytes": bytes.len(),
            "content": content,
        }))
    }
}

#[async_trait]
impl BuiltinTool for FileReaderTool {
    fn name(&self) -> &str {
        "file_reader"
    }

    fn description(&self) -> &str {
        "Read a file from the user workspace. Pass encoding=base64 for binary files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string"},
                "encoding": {"type": "string", "enum": ["utf-8", "base64"]}
            },
            "required": ["filename"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        match self.read(arguments, user).await {
            Ok(result) => BuiltinToolResult::ok(result),
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}
