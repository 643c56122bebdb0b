//! Agent-host orchestration: one state machine per WebSocket connection,
//! driving reactive and template-driven (proactive) flows and translating
//! LLM run events into protocol messages.

pub mod context;
pub mod convo;
pub mod llm;
pub mod protocol;

pub use context::{ConversationContext, ConversationState, ItemExecutionState};
pub use convo::{
    AgentDefinition, CommandPort, Conversation, ConversationReader, DefinitionReader, ItemContent,
    RepositoryToolCatalog, StaticDefinitionReader, StaticTemplateReader, Template, TemplateItem,
    TemplateReader, ToolCatalog,
};
pub use llm::{ChatMessage, LlmRunner, LlmToolDescriptor, RunEvent, RunRequest};
pub use protocol::{ProtocolMessage, WireSink};

use crate::errors::{ToolgateError, ToolgateResult};
use futures_util::StreamExt;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    contexts: Mutex<HashMap<String, ConversationContext>>,
    conversations: Arc<dyn ConversationReader>,
    definitions: Arc<dyn DefinitionReader>,
    templates: Arc<dyn TemplateReader>,
    catalog: Arc<dyn ToolCatalog>,
    commands: Arc<dyn CommandPort>,
    llm: Arc<dyn LlmRunner>,
    wire: Arc<dyn WireSink>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<dyn ConversationReader>,
        definitions: Arc<dyn DefinitionReader>,
        templates: Arc<dyn TemplateReader>,
        catalog: Arc<dyn ToolCatalog>,
        commands: Arc<dyn CommandPort>,
        llm: Arc<dyn LlmRunner>,
        wire: Arc<dyn WireSink>,
    ) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            conversations,
            definitions,
            templates,
            catalog,
            commands,
            llm,
            wire,
        }
    }

    /// Load the connection's initial state and send the conversation config.
    /// The flow itself starts only on an explicit [`Orchestrator::begin_flow`].
    pub async fn initialize(
        &self,
        connection_id: &str,
        conversation_id: &str,
        user_id: &str,
        access_token: &str,
    ) -> ToolgateResult<()> {
        let conversation = self
            .conversations
            .get(conversation_id)
            .await?
            .ok_or_else(|| ToolgateError::not_found("conversation", conversation_id))?;
        if conversation.user_id != user_id {
            return Err(ToolgateError::forbidden(
                "conversation belongs to a different user",
            ));
        }

        let definition = self
            .definitions
            .get(&conversation.definition_id)
            .await?
            .ok_or_else(|| ToolgateError::not_found("definition", &conversation.definition_id))?;

        let mut context = ConversationContext::new(
            connection_id,
            conversation_id,
            user_id,
            &definition.id,
        );
        context.access_token = access_token.to_string();
        context.model = definition.model.clone();
        context.template_id = definition.template_id.clone();

        let template = match &definition.template_id {
            Some(template_id) => Some(
                self.templates
                    .get(template_id)
                    .await?
                    .ok_or_else(|| ToolgateError::not_found("template", template_id))?,
            ),
            None => None,
        };
        context.is_proactive = template
            .as_ref()
            .is_some_and(|t| t.agent_starts_first);

        if !access_token.is_empty() {
            context.tools = self.catalog.tools_for(&definition, access_token).await?;
            debug!(
                "loaded {} tools for conversation {}",
                context.tools.len(),
                conversation_id
            );
        }

        self.send_conversation_config(&context, template.as_ref(), &definition)
            .await?;

        context.state = if context.is_proactive {
            ConversationState::Presenting
        } else {
            ConversationState::Ready
        };
        info!(
            "conversation {} initialized on connection {} ({})",
            conversation_id,
            connection_id,
            if context.is_proactive { "proactive" } else { "reactive" }
        );
        self.contexts
            .lock()
            .await
            .insert(connection_id.to_string(), context);
        Ok(())
    }

    /// Drop the per-connection state on disconnect.
    pub async fn cleanup(&self, connection_id: &str) {
        self.contexts.lock().await.remove(connection_id);
    }

    pub async fn get_state(&self, connection_id: &str) -> Option<ConversationState> {
        self.contexts
            .lock()
            .await
            .get(connection_id)
            .map(|c| c.state)
    }

    /// Start the flow after the client acked the handshake.
    pub async fn begin_flow(&self, connection_id: &str) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        if context.is_proactive {
            let template = self.require_template(&context).await?;
            if let Some(introduction) = &template.introduction_message {
                self.stream_assistant_text(&context, introduction).await?;
            }
            self.present_item(connection_id, 0).await
        } else {
            self.send(&context, ProtocolMessage::chat_input(&context.conversation_id, true))
                .await
        }
    }

    /// Reactive path: persist, run the agent, translate the event stream.
    pub async fn handle_user_message(
        &self,
        connection_id: &str,
        content: &str,
    ) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        self.send(
            &context,
            ProtocolMessage::message_ack(&context.conversation_id, "received"),
        )
        .await?;

        let pending_assistant_id = self
            .commands
            .persist_user_message(&context.conversation_id, content)
            .await
            .map_err(|e| ToolgateError::internal(format!("persisting user message failed: {}", e)))?;

        self.set_state(connection_id, ConversationState::Processing)
            .await;

        let history = self
            .conversations
            .get(&context.conversation_id)
            .await?
            .map(|c| c.history)
            .unwrap_or_default();

        let request = RunRequest {
            conversation_id: context.conversation_id.clone(),
            history,
            user_message: content.to_string(),
            tools: context.tools.clone(),
            model: context.model.clone(),
        };
        let full_content = self.run_agent_stream(&context, request).await?;

        if let (Some(content), Some(message_id)) = (&full_content, &pending_assistant_id) {
            self.commands
                .complete_message(&context.conversation_id, message_id, content)
                .await
                .map_err(|e| {
                    ToolgateError::internal(format!("completing assistant message failed: {}", e))
                })?;
        }

        self.set_state(connection_id, ConversationState::Ready).await;
        Ok(())
    }

    /// Consume the LLM event stream, translating each event to its wire
    /// effect. Returns the accumulated assistant content, or `None` when the
    /// run failed.
    async fn run_agent_stream(
        &self,
        context: &ConversationContext,
        request: RunRequest,
    ) -> ToolgateResult<Option<String>> {
        let message_id = Uuid::new_v4().to_string();
        let mut accumulated = String::new();
        let conversation_id = context.conversation_id.clone();

        let mut stream = self.llm.run_stream(request).await;
        while let Some(event) = stream.next().await {
            match event {
                RunEvent::RunStarted => {
                    self.send(context, ProtocolMessage::chat_input(&conversation_id, false))
                        .await?;
                }
                RunEvent::ResponseChunk { content } => {
                    accumulated.push_str(&content);
                    self.send(
                        context,
                        ProtocolMessage::content_chunk(&conversation_id, &message_id, &content, false),
                    )
                    .await?;
                }
                RunEvent::ToolExecutionStarted { call_id, tool_name, arguments } => {
                    self.send(
                        context,
                        ProtocolMessage::tool_call(&conversation_id, &call_id, &tool_name, &arguments),
                    )
                    .await?;
                }
                RunEvent::ToolExecutionCompleted {
                    call_id,
                    tool_name,
                    success,
                    result,
                    execution_time_ms,
                } => {
                    self.send(
                        context,
                        ProtocolMessage::tool_result(
                            &conversation_id,
                            &call_id,
                            &tool_name,
                            success,
                            &result,
                            execution_time_ms,
                        ),
                    )
                    .await?;
                }
                RunEvent::RunCompleted => {
                    self.send(
                        context,
                        ProtocolMessage::content_chunk(&conversation_id, &message_id, "", true),
                    )
                    .await?;
                    self.send(
                        context,
                        ProtocolMessage::content_complete(&conversation_id, &message_id, &accumulated),
                    )
                    .await?;
                    self.send(context, ProtocolMessage::chat_input(&conversation_id, true))
                        .await?;
                }
                RunEvent::RunFailed { error } => {
                    warn!("agent run failed for {}: {}", conversation_id, error);
                    self.send(
                        context,
                        ProtocolMessage::error(&conversation_id, "agent", "AGENT_ERROR", &error, false),
                    )
                    .await?;
                    self.send(context, ProtocolMessage::chat_input(&conversation_id, true))
                        .await?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(accumulated))
    }

    /// Proactive path: record a widget response and advance when the item's
    /// completion predicate fires.
    pub async fn handle_widget_response(
        &self,
        connection_id: &str,
        widget_id: &str,
        value: Value,
    ) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        self.send(
            &context,
            ProtocolMessage::response_ack(&context.conversation_id, widget_id, "received"),
        )
        .await?;

        let (complete, item_id, responses) = {
            let mut contexts = self.contexts.lock().await;
            let context = contexts
                .get_mut(connection_id)
                .ok_or_else(|| ToolgateError::not_found("connection", connection_id))?;
            let Some(item_state) = context.current_item_state.as_mut() else {
                debug!("widget response with no active item; ignoring");
                return Ok(());
            };
            if widget_id == item_state.confirmation_widget_id() {
                item_state.user_confirmed = true;
            } else {
                item_state.record_response(widget_id, value);
            }
            (
                item_state.is_complete(),
                item_state.item_id.clone(),
                item_state.widget_responses.clone(),
            )
        };

        if complete {
            let responses: serde_json::Map<String, Value> = responses.into_iter().collect();
            self.commands
                .record_item_response(&context.conversation_id, &item_id, &responses)
                .await
                .map_err(|e| ToolgateError::internal(format!("recording item response failed: {}", e)))?;
            let next_index = {
                let contexts = self.contexts.lock().await;
                contexts
                    .get(connection_id)
                    .map(|c| c.current_item_index + 1)
                    .unwrap_or_default()
            };
            self.commands
                .advance_template(&context.conversation_id, next_index)
                .await
                .map_err(|e| ToolgateError::internal(format!("advancing template failed: {}", e)))?;
            self.present_item(connection_id, next_index).await?;
        }
        Ok(())
    }

    /// Present template items starting at `index`: context message, contents
    /// in order, an optional synthetic confirmation widget, then suspend or
    /// stay ready. Items with nothing interactive (message-only) advance
    /// automatically, so a trailing message item flows straight into
    /// completion.
    pub async fn present_item(&self, connection_id: &str, index: usize) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        let template = self.require_template(&context).await?;
        let total_items = template.items.len();
        let mut index = index;

        loop {
            let Some(item) = template.items.get(index) else {
                return self.complete_flow(connection_id, &template).await;
            };

            self.set_state(connection_id, ConversationState::Presenting)
                .await;

            self.send(
                &context,
                ProtocolMessage::new(
                    "control.item.context",
                    &context.conversation_id,
                    json!({
                        "itemId": item.id,
                        "itemIndex": index,
                        "totalItems": total_items,
                        "itemTitle": item.title,
                        "enableChatInput": template.enable_chat_input_initially,
                        "timeLimitSeconds": item.time_limit_seconds,
                        "showRemainingTime": item.show_remaining_time,
                        "widgetCompletionBehavior": item.widget_completion_behavior,
                    }),
                ),
            )
            .await?;

            let mut required_widget_ids = std::collections::BTreeSet::new();
            let mut has_widgets = false;
            for content in &item.contents {
                if content.is_message() {
                    let stem = self
                        .resolve_stem(&context, &template, item, content, index, total_items)
                        .await;
                    if !stem.is_empty() {
                        self.stream_assistant_text(&context, &stem).await?;
                    }
                } else {
                    has_widgets = true;
                    if content.required {
                        required_widget_ids.insert(content.widget_id.clone());
                    }
                    self.send_widget_render(&context, item, content).await?;
                }
            }

            if item.require_user_confirmation {
                self.send_confirmation_widget(&context, item).await?;
            }

            let suspend = !required_widget_ids.is_empty() || item.require_user_confirmation;
            let item_state = ItemExecutionState::new(
                &item.id,
                index,
                required_widget_ids,
                item.require_user_confirmation,
            );
            {
                let mut contexts = self.contexts.lock().await;
                if let Some(stored) = contexts.get_mut(connection_id) {
                    stored.current_item_index = index;
                    stored.current_item_state = Some(item_state);
                    stored.state = if suspend {
                        ConversationState::Suspended
                    } else {
                        ConversationState::Ready
                    };
                }
            }

            if suspend {
                return Ok(());
            }
            if has_widgets {
                // Optional widgets only: wait for input with chat enabled.
                return self
                    .send(&context, ProtocolMessage::chat_input(&context.conversation_id, true))
                    .await;
            }

            // Message-only item: advance immediately.
            index += 1;
            self.commands
                .advance_template(&context.conversation_id, index)
                .await
                .map_err(|e| ToolgateError::internal(format!("advancing template failed: {}", e)))?;
        }
    }

    async fn complete_flow(&self, connection_id: &str, template: &Template) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        if let Some(completion) = &template.completion_message {
            self.stream_assistant_text(&context, completion).await?;
        }

        let (state, chat_enabled) = if template.continue_after_completion {
            (ConversationState::Ready, true)
        } else {
            (ConversationState::Completed, false)
        };
        self.set_state(connection_id, state).await;
        self.send(
            &context,
            ProtocolMessage::chat_input(&context.conversation_id, chat_enabled),
        )
        .await?;
        info!(
            "proactive flow for {} completed (continue_after_completion: {})",
            context.conversation_id, template.continue_after_completion
        );
        Ok(())
    }

    pub async fn handle_flow_pause(&self, connection_id: &str) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        self.set_state(connection_id, ConversationState::Paused).await;
        self.send(
            &context,
            ProtocolMessage::new(
                "control.conversation.pause",
                &context.conversation_id,
                json!({"status": "paused"}),
            ),
        )
        .await
    }

    pub async fn handle_flow_resume(&self, connection_id: &str) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        self.set_state(connection_id, ConversationState::Ready).await;
        self.send(&context, ProtocolMessage::chat_input(&context.conversation_id, true))
            .await
    }

    /// Cancel clears pending widget state and returns to READY. An upstream
    /// call already in flight completes and is discarded.
    pub async fn handle_flow_cancel(&self, connection_id: &str) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        {
            let mut contexts = self.contexts.lock().await;
            if let Some(stored) = contexts.get_mut(connection_id) {
                stored.current_item_state = None;
                stored.state = ConversationState::Ready;
            }
        }
        self.send(&context, ProtocolMessage::chat_input(&context.conversation_id, true))
            .await
    }

    /// Validate and apply a model override; an invalid id fails loudly and
    /// leaves the context unchanged.
    pub async fn handle_model_change(
        &self,
        connection_id: &str,
        model_id: &str,
    ) -> ToolgateResult<()> {
        let context = self.context_snapshot(connection_id).await?;
        if !self.llm.is_valid_model(model_id) {
            self.send(
                &context,
                ProtocolMessage::error(
                    &context.conversation_id,
                    "configuration",
                    "INVALID_MODEL",
                    &format!("model '{}' is not available", model_id),
                    false,
                ),
            )
            .await?;
            return Err(ToolgateError::new(
                crate::errors::ErrorKind::ValidationError,
                format!("model '{}' is not available", model_id),
            ));
        }
        let mut contexts = self.contexts.lock().await;
        if let Some(stored) = contexts.get_mut(connection_id) {
            stored.model = Some(model_id.to_string());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn context_snapshot(&self, connection_id: &str) -> ToolgateResult<ConversationContext> {
        self.contexts
            .lock()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| ToolgateError::not_found("connection", connection_id))
    }

    async fn set_state(&self, connection_id: &str, state: ConversationState) {
        if let Some(context) = self.contexts.lock().await.get_mut(connection_id) {
            context.state = state;
        }
    }

    async fn require_template(&self, context: &ConversationContext) -> ToolgateResult<Template> {
        let template_id = context
            .template_id
            .as_deref()
            .ok_or_else(|| ToolgateError::internal("proactive flow without a template"))?;
        self.templates
            .get(template_id)
            .await?
            .ok_or_else(|| ToolgateError::not_found("template", template_id))
    }

    async fn send(&self, context: &ConversationContext, message: ProtocolMessage) -> ToolgateResult<()> {
        self.wire
            .send(&context.connection_id, message)
            .await
            .map_err(|e| ToolgateError::internal(format!("wire send failed: {}", e)))
    }

    async fn send_conversation_config(
        &self,
        context: &ConversationContext,
        template: Option<&Template>,
        definition: &AgentDefinition,
    ) -> ToolgateResult<()> {
        let payload = match template {
            Some(template) => json!({
                "templateId": template.id,
                "templateName": template.name,
                "totalItems": template.items.len(),
                "displayMode": template.display_mode,
                "showConversationHistory": template.show_conversation_history,
                "allowBackwardNavigation": template.allow_backward_navigation,
                "allowConcurrentItemWidgets": template.allow_concurrent_item_widgets,
                "allowSkip": template.allow_skip,
                "enableChatInputInitially": template.enable_chat_input_initially,
                "displayProgressIndicator": template.display_progress_indicator,
                "displayFinalScoreReport": template.display_final_score_report,
                "continueAfterCompletion": template.continue_after_completion,
            }),
            None => json!({
                "templateId": Value::Null,
                "templateName": definition.name,
                "totalItems": 0,
                "displayMode": "inline",
                "enableChatInputInitially": true,
            }),
        };
        self.send(
            context,
            ProtocolMessage::new("control.conversation.config", &context.conversation_id, payload),
        )
        .await
    }

    /// Stream a server-authored text as an assistant message (one chunk,
    /// then the final marker and the complete message).
    async fn stream_assistant_text(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> ToolgateResult<()> {
        let message_id = Uuid::new_v4().to_string();
        self.send(
            context,
            ProtocolMessage::content_chunk(&context.conversation_id, &message_id, text, false),
        )
        .await?;
        self.send(
            context,
            ProtocolMessage::content_chunk(&context.conversation_id, &message_id, "", true),
        )
        .await?;
        self.send(
            context,
            ProtocolMessage::content_complete(&context.conversation_id, &message_id, text),
        )
        .await
    }

    /// Resolve a content stem: templated stems are generated with a
    /// single-shot LLM call against the item instructions; all stems get
    /// the restricted variable substitution.
    async fn resolve_stem(
        &self,
        context: &ConversationContext,
        template: &Template,
        item: &TemplateItem,
        content: &ItemContent,
        index: usize,
        total_items: usize,
    ) -> String {
        let variables = stem_variables(context, template, index, total_items);

        if content.is_templated {
            if let Some(instructions) = &item.instructions {
                let prompt = substitute(instructions, &variables);
                match self.llm.generate(&prompt, context.model.as_deref()).await {
                    Ok(generated) => return generated,
                    Err(e) => {
                        warn!("templated stem generation failed, using raw stem: {}", e);
                    }
                }
            }
        }
        substitute(content.stem.as_deref().unwrap_or_default(), &variables)
    }

    async fn send_widget_render(
        &self,
        context: &ConversationContext,
        item: &TemplateItem,
        content: &ItemContent,
    ) -> ToolgateResult<()> {
        // `correct_answer` stays server-side for scoring.
        self.send(
            context,
            ProtocolMessage::new(
                "control.widget.render",
                &context.conversation_id,
                json!({
                    "itemId": item.id,
                    "widgetId": content.widget_id,
                    "widgetType": content.widget_type,
                    "stem": content.stem,
                    "options": content.options,
                    "widgetConfig": content.widget_config,
                    "required": content.required,
                    "skippable": content.skippable,
                    "initialValue": content.initial_value,
                    "showUserResponse": content.show_user_response,
                    "layout": content.layout,
                    "constraints": content.constraints,
                }),
            ),
        )
        .await
    }

    /// Synthetic confirmation button; its click feeds only `user_confirmed`.
    async fn send_confirmation_widget(
        &self,
        context: &ConversationContext,
        item: &TemplateItem,
    ) -> ToolgateResult<()> {
        self.send(
            context,
            ProtocolMessage::new(
                "control.widget.render",
                &context.conversation_id,
                json!({
                    "itemId": item.id,
                    "widgetId": format!("{}-confirm", item.id),
                    "widgetType": "button",
                    "stem": "Continue",
                    "required": true,
                    "skippable": false,
                    "showUserResponse": false,
                    "layout": "horizontal",
                }),
            ),
        )
        .await
    }
}

/// Restricted variable set for stem rendering.
fn stem_variables(
    context: &ConversationContext,
    template: &Template,
    index: usize,
    total_items: usize,
) -> Map<String, Value> {
    let mut variables = Map::new();
    variables.insert("user_id".into(), json!(context.user_id));
    variables.insert("agent_name".into(), json!(template.name));
    variables.insert("current_item".into(), json!(index + 1));
    variables.insert("total_items".into(), json!(total_items));
    variables.insert("timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
    variables.insert("conversation_id".into(), json!(context.conversation_id));
    variables
}

/// Stem substitution is forgiving: an unresolvable template leaves the text
/// as authored rather than failing the presentation.
fn substitute(text: &str, variables: &Map<String, Value>) -> String {
    match crate::template::render(text, variables, "stem") {
        Ok(rendered) => rendered,
        Err(_) => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_substitution_fills_known_variables() {
        let context = ConversationContext::new("conn", "conv-1", "user-9", "def");
        let template = Template {
            id: "t".into(),
            name: "Onboarding".into(),
            agent_starts_first: true,
            introduction_message: None,
            completion_message: None,
            continue_after_completion: false,
            display_mode: "inline".into(),
            show_conversation_history: false,
            allow_backward_navigation: false,
            allow_concurrent_item_widgets: false,
            allow_skip: false,
            enable_chat_input_initially: false,
            display_progress_indicator: false,
            display_final_score_report: false,
            items: Vec::new(),
        };
        let variables = stem_variables(&context, &template, 1, 4);
        let rendered = substitute(
            "Step {{ current_item }} of {{ total_items }} for {{ user_id }}",
            &variables,
        );
        assert_eq!(rendered, "Step 2 of 4 for user-9");
    }

    #[test]
    fn unresolvable_stem_stays_as_authored() {
        let rendered = substitute("Hello {{ unknown_var }}", &Map::new());
        assert_eq!(rendered, "Hello {{ unknown_var }}");
    }
}
