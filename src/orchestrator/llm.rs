use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message of conversation history handed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Tool descriptor in the shape LLM providers consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool arguments.
    pub parameters: Value,
}

/// Everything an agent run needs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub conversation_id: String,
    pub history: Vec<ChatMessage>,
    pub user_message: String,
    pub tools: Vec<LlmToolDescriptor>,
    pub model: Option<String>,
}

/// Typed events produced by one agent run, in stream order.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted,
    ResponseChunk {
        content: String,
    },
    ToolExecutionStarted {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolExecutionCompleted {
        call_id: String,
        tool_name: String,
        success: bool,
        result: Value,
        execution_time_ms: u64,
    },
    RunCompleted,
    RunFailed {
        error: String,
    },
}

/// The LLM provider boundary. This crate consumes a provider; it does not
/// own one.
#[async_trait]
pub trait LlmRunner: Send + Sync {
    /// Run the agent over the request, yielding [`RunEvent`]s in order.
    /// Tool calls are executed by the runner through its own executor
    /// binding; the orchestrator only translates the events to the wire.
    async fn run_stream(&self, request: RunRequest) -> BoxStream<'static, RunEvent>;

    /// Single-shot generation for templated item stems.
    async fn generate(&self, prompt: &str, model: Option<&str>) -> anyhow::Result<String>;

    /// Whether `model` is a valid id for this provider factory.
    fn is_valid_model(&self, model: &str) -> bool;
}
