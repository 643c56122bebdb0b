use crate::orchestrator::llm::LlmToolDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Conversation flow states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Ready,
    Presenting,
    Processing,
    Suspended,
    Paused,
    Completed,
    Error,
}

/// Tracking for the currently presented template item.
#[derive(Debug, Clone)]
pub struct ItemExecutionState {
    pub item_id: String,
    pub item_index: usize,
    pub required_widget_ids: BTreeSet<String>,
    pub answered_widget_ids: BTreeSet<String>,
    pub widget_responses: BTreeMap<String, Value>,
    pub require_user_confirmation: bool,
    pub user_confirmed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ItemExecutionState {
    pub fn new(
        item_id: impl Into<String>,
        item_index: usize,
        required_widget_ids: BTreeSet<String>,
        require_user_confirmation: bool,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            item_index,
            required_widget_ids,
            answered_widget_ids: BTreeSet::new(),
            widget_responses: BTreeMap::new(),
            require_user_confirmation,
            user_confirmed: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Widget responses arrive in any order; record them commutatively.
    pub fn record_response(&mut self, widget_id: &str, value: Value) {
        self.widget_responses.insert(widget_id.to_string(), value);
        if self.required_widget_ids.contains(widget_id) {
            self.answered_widget_ids.insert(widget_id.to_string());
        }
    }

    /// Complete iff every required widget answered and, when confirmation is
    /// demanded, the user confirmed.
    pub fn is_complete(&self) -> bool {
        self.required_widget_ids.is_subset(&self.answered_widget_ids)
            && (!self.require_user_confirmation || self.user_confirmed)
    }

    /// Synthetic confirmation widget id for this item.
    pub fn confirmation_widget_id(&self) -> String {
        format!("{}-confirm", self.item_id)
    }
}

/// Per-connection, in-memory conversation state. Never shared across
/// connections.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub connection_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub access_token: String,
    pub definition_id: String,
    pub template_id: Option<String>,
    pub is_proactive: bool,
    pub tools: Vec<LlmToolDescriptor>,
    pub model: Option<String>,
    pub state: ConversationState,
    pub current_item_index: usize,
    pub current_item_state: Option<ItemExecutionState>,
}

impl ConversationContext {
    pub fn new(
        connection_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        definition_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            access_token: String::new(),
            definition_id: definition_id.into(),
            template_id: None,
            is_proactive: false,
            tools: Vec::new(),
            model: None,
            state: ConversationState::Ready,
            current_item_index: 0,
            current_item_state: None,
        }
    }
}
