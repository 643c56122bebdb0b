//! Read-model types and persistence ports consumed by the orchestrator.
//!
//! The event-sourced store and its projections live outside this crate;
//! these contracts are what the orchestrator reads and the commands it
//! dispatches.

use crate::orchestrator::llm::{ChatMessage, LlmToolDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation read model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub definition_id: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// Agent definition read model: which template drives it, which tools it
/// may see, and an optional model override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Opaque tool filters supplied from outside; empty allow-list means
    /// everything not denied.
    #[serde(default)]
    pub tool_allowlist: Vec<String>,
    #[serde(default)]
    pub tool_denylist: Vec<String>,
}

/// Template read model: an authored sequence of items driving a proactive
/// conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agent_starts_first: bool,
    #[serde(default)]
    pub introduction_message: Option<String>,
    #[serde(default)]
    pub completion_message: Option<String>,
    #[serde(default)]
    pub continue_after_completion: bool,
    #[serde(default = "default_display_mode")]
    pub display_mode: String,
    #[serde(default)]
    pub show_conversation_history: bool,
    #[serde(default)]
    pub allow_backward_navigation: bool,
    #[serde(default)]
    pub allow_concurrent_item_widgets: bool,
    #[serde(default)]
    pub allow_skip: bool,
    #[serde(default)]
    pub enable_chat_input_initially: bool,
    #[serde(default)]
    pub display_progress_indicator: bool,
    #[serde(default)]
    pub display_final_score_report: bool,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
}

fn default_display_mode() -> String {
    "inline".to_string()
}

/// One step in a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Generation instructions for templated contents.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub require_user_confirmation: bool,
    #[serde(default)]
    pub time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub show_remaining_time: bool,
    #[serde(default = "default_completion_behavior")]
    pub widget_completion_behavior: String,
    #[serde(default)]
    pub contents: Vec<ItemContent>,
}

fn default_completion_behavior() -> String {
    "all_required".to_string()
}

/// One content piece: a message or an interactive widget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemContent {
    pub widget_id: String,
    /// `message` renders as an assistant stream; anything else renders as a
    /// widget descriptor.
    pub widget_type: String,
    #[serde(default)]
    pub stem: Option<String>,
    #[serde(default)]
    pub options: Option<Value>,
    #[serde(default)]
    pub widget_config: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub initial_value: Option<Value>,
    #[serde(default = "default_true")]
    pub show_user_response: bool,
    #[serde(default = "default_layout")]
    pub layout: String,
    #[serde(default)]
    pub constraints: Option<Value>,
    /// Stem is generated by a single-shot LLM call against the item
    /// instructions.
    #[serde(default)]
    pub is_templated: bool,
    /// Included for server-side scoring; never sent to the client.
    #[serde(default)]
    pub correct_answer: Option<Value>,
}

fn default_true() -> bool {
    true
}

fn default_layout() -> String {
    "vertical".to_string()
}

impl ItemContent {
    pub fn is_message(&self) -> bool {
        self.widget_type == "message"
    }
}

/// Read access to conversations.
#[async_trait]
pub trait ConversationReader: Send + Sync {
    async fn get(&self, conversation_id: &str) -> anyhow::Result<Option<Conversation>>;
}

/// Read access to agent definitions.
#[async_trait]
pub trait DefinitionReader: Send + Sync {
    async fn get(&self, definition_id: &str) -> anyhow::Result<Option<AgentDefinition>>;
}

/// Read access to templates.
#[async_trait]
pub trait TemplateReader: Send + Sync {
    async fn get(&self, template_id: &str) -> anyhow::Result<Option<Template>>;
}

/// The tool catalogue filtered by the definition's allow/deny lists.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn tools_for(
        &self,
        definition: &AgentDefinition,
        access_token: &str,
    ) -> anyhow::Result<Vec<LlmToolDescriptor>>;
}

/// Static definition reader over a fixed map; used by tests and bootstrap.
#[derive(Default)]
pub struct StaticDefinitionReader {
    definitions: std::collections::HashMap<String, AgentDefinition>,
}

impl StaticDefinitionReader {
    pub fn new(definitions: Vec<AgentDefinition>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            definitions: definitions.into_iter().map(|d| (d.id.clone(), d)).collect(),
        })
    }
}

#[async_trait]
impl DefinitionReader for StaticDefinitionReader {
    async fn get(&self, definition_id: &str) -> anyhow::Result<Option<AgentDefinition>> {
        Ok(self.definitions.get(definition_id).cloned())
    }
}

/// Static template reader over a fixed map; used by tests and bootstrap.
#[derive(Default)]
pub struct StaticTemplateReader {
    templates: std::collections::HashMap<String, Template>,
}

impl StaticTemplateReader {
    pub fn new(templates: Vec<Template>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        })
    }
}

#[async_trait]
impl TemplateReader for StaticTemplateReader {
    async fn get(&self, template_id: &str) -> anyhow::Result<Option<Template>> {
        Ok(self.templates.get(template_id).cloned())
    }
}

/// Catalogue backed by the tool repository: enabled, active tools filtered
/// by the definition's allow/deny lists, in the provider descriptor shape.
pub struct RepositoryToolCatalog {
    tools: std::sync::Arc<dyn crate::storage::ToolRepository>,
}

impl RepositoryToolCatalog {
    pub fn new(tools: std::sync::Arc<dyn crate::storage::ToolRepository>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { tools })
    }
}

#[async_trait]
impl ToolCatalog for RepositoryToolCatalog {
    async fn tools_for(
        &self,
        definition: &AgentDefinition,
        _access_token: &str,
    ) -> anyhow::Result<Vec<LlmToolDescriptor>> {
        let descriptors = self
            .tools
            .list_all()
            .await?
            .into_iter()
            .filter(|aggregate| {
                aggregate.is_enabled
                    && aggregate.status == crate::domain::ToolStatus::Active
                    && (definition.tool_allowlist.is_empty()
                        || definition.tool_allowlist.contains(&aggregate.definition.name)
                        || definition.tool_allowlist.contains(&aggregate.id))
                    && !definition.tool_denylist.contains(&aggregate.definition.name)
                    && !definition.tool_denylist.contains(&aggregate.id)
            })
            .map(|aggregate| LlmToolDescriptor {
                name: aggregate.definition.name.clone(),
                description: aggregate.definition.description.clone(),
                parameters: aggregate.definition.input_schema.clone(),
            })
            .collect();
        Ok(descriptors)
    }
}

/// Persistence commands dispatched by the orchestrator. Within one
/// conversation they are applied in dispatch order.
#[async_trait]
pub trait CommandPort: Send + Sync {
    /// Persist the user message; returns the pending assistant-message id
    /// when the handler pre-allocated one.
    async fn persist_user_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Persist the completed assistant message.
    async fn complete_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> anyhow::Result<()>;

    /// Persist the responses collected for one template item.
    async fn record_item_response(
        &self,
        conversation_id: &str,
        item_id: &str,
        responses: &serde_json::Map<String, Value>,
    ) -> anyhow::Result<()>;

    /// Persist the advance to `next_item_index`.
    async fn advance_template(
        &self,
        conversation_id: &str,
        next_item_index: usize,
    ) -> anyhow::Result<()>;
}
