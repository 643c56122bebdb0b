//! Persisted-interface contracts consumed by the core.
//!
//! The event-sourced store behind these traits is an external collaborator;
//! the in-memory implementations here back tests and single-process setups.

use crate::domain::{AuthConfig, SourceAggregate, ToolAggregate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Repository for source aggregates. A missing aggregate surfaces as `None`,
/// never as an error.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<SourceAggregate>>;
    async fn add(&self, aggregate: SourceAggregate) -> anyhow::Result<()>;
    async fn update(&self, aggregate: SourceAggregate) -> anyhow::Result<()>;
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<SourceAggregate>>;
}

/// Repository for tool aggregates keyed `source_id:name`.
#[async_trait]
pub trait ToolRepository: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ToolAggregate>>;
    async fn add(&self, aggregate: ToolAggregate) -> anyhow::Result<()>;
    async fn update(&self, aggregate: ToolAggregate) -> anyhow::Result<()>;
    async fn remove(&self, id: &str) -> anyhow::Result<()>;
    async fn list_by_source(&self, source_id: &str) -> anyhow::Result<Vec<ToolAggregate>>;
    async fn list_all(&self) -> anyhow::Result<Vec<ToolAggregate>>;
}

/// Read-only access to source credential material. Never written by this
/// system; the secrets backend is external.
#[async_trait]
pub trait SecretsStore: Send + Sync {
    async fn get_auth_config(&self, source_id: &str) -> anyhow::Result<Option<AuthConfig>>;
}

#[derive(Default)]
pub struct InMemorySourceRepository {
    sources: Mutex<HashMap<String, SourceAggregate>>,
}

impl InMemorySourceRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SourceRepository for InMemorySourceRepository {
    async fn get(&self, id: &str) -> anyhow::Result<Option<SourceAggregate>> {
        Ok(self.sources.lock().await.get(id).cloned())
    }

    async fn add(&self, aggregate: SourceAggregate) -> anyhow::Result<()> {
        let mut sources = self.sources.lock().await;
        if sources.contains_key(&aggregate.id) {
            anyhow::bail!("source '{}' already exists", aggregate.id);
        }
        sources.insert(aggregate.id.clone(), aggregate);
        Ok(())
    }

    async fn update(&self, aggregate: SourceAggregate) -> anyhow::Result<()> {
        self.sources
            .lock()
            .await
            .insert(aggregate.id.clone(), aggregate);
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.sources.lock().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<SourceAggregate>> {
        let mut all: Vec<_> = self.sources.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

#[derive(Default)]
pub struct InMemoryToolRepository {
    tools: Mutex<HashMap<String, ToolAggregate>>,
}

impl InMemoryToolRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn get(&self, id: &str) -> anyhow::Result<Option<ToolAggregate>> {
        Ok(self.tools.lock().await.get(id).cloned())
    }

    async fn add(&self, aggregate: ToolAggregate) -> anyhow::Result<()> {
        let mut tools = self.tools.lock().await;
        if tools.contains_key(&aggregate.id) {
            anyhow::bail!("tool '{}' already exists", aggregate.id);
        }
        tools.insert(aggregate.id.clone(), aggregate);
        Ok(())
    }

    async fn update(&self, aggregate: ToolAggregate) -> anyhow::Result<()> {
        self.tools
            .lock()
            .await
            .insert(aggregate.id.clone(), aggregate);
        Ok(())
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.tools.lock().await.remove(id);
        Ok(())
    }

    async fn list_by_source(&self, source_id: &str) -> anyhow::Result<Vec<ToolAggregate>> {
        let mut matching: Vec<_> = self
            .tools
            .lock()
            .await
            .values()
            .filter(|t| t.source_id == source_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ToolAggregate>> {
        let mut all: Vec<_> = self.tools.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

/// Secrets store backed by a static map; used in tests and bootstrap code.
#[derive(Default)]
pub struct StaticSecretsStore {
    configs: HashMap<String, AuthConfig>,
}

impl StaticSecretsStore {
    pub fn new(configs: HashMap<String, AuthConfig>) -> Arc<Self> {
        Arc::new(Self { configs })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SecretsStore for StaticSecretsStore {
    async fn get_auth_config(&self, source_id: &str) -> anyhow::Result<Option<AuthConfig>> {
        Ok(self.configs.get(source_id).cloned())
    }
}

/// In-memory conversation store: read model plus the persistence commands
/// the orchestrator dispatches. Backs tests and single-process setups.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, crate::orchestrator::Conversation>>,
    item_responses: Mutex<Vec<(String, String, serde_json::Map<String, serde_json::Value>)>>,
    template_positions: Mutex<HashMap<String, usize>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, conversation: crate::orchestrator::Conversation) {
        self.conversations
            .lock()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    pub async fn recorded_item_responses(
        &self,
    ) -> Vec<(String, String, serde_json::Map<String, serde_json::Value>)> {
        self.item_responses.lock().await.clone()
    }

    pub async fn template_position(&self, conversation_id: &str) -> Option<usize> {
        self.template_positions
            .lock()
            .await
            .get(conversation_id)
            .copied()
    }
}

#[async_trait]
impl crate::orchestrator::ConversationReader for InMemoryConversationStore {
    async fn get(
        &self,
        conversation_id: &str,
    ) -> anyhow::Result<Option<crate::orchestrator::Conversation>> {
        Ok(self.conversations.lock().await.get(conversation_id).cloned())
    }
}

#[async_trait]
impl crate::orchestrator::CommandPort for InMemoryConversationStore {
    async fn persist_user_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> anyhow::Result<Option<String>> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation '{}' not found", conversation_id))?;
        conversation
            .history
            .push(crate::orchestrator::ChatMessage::user(content));
        Ok(Some(uuid::Uuid::new_v4().to_string()))
    }

    async fn complete_message(
        &self,
        conversation_id: &str,
        _message_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation '{}' not found", conversation_id))?;
        conversation
            .history
            .push(crate::orchestrator::ChatMessage::assistant(content));
        Ok(())
    }

    async fn record_item_response(
        &self,
        conversation_id: &str,
        item_id: &str,
        responses: &serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<()> {
        self.item_responses.lock().await.push((
            conversation_id.to_string(),
            item_id.to_string(),
            responses.clone(),
        ));
        Ok(())
    }

    async fn advance_template(
        &self,
        conversation_id: &str,
        next_item_index: usize,
    ) -> anyhow::Result<()> {
        self.template_positions
            .lock()
            .await
            .insert(conversation_id.to_string(), next_item_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuthMode, SourceType, ToolDefinition};
    use chrono::Utc;

    #[tokio::test]
    async fn source_repo_rejects_duplicate_add() {
        let repo = InMemorySourceRepository::new();
        let (agg, _) = SourceAggregate::register(
            "orders",
            "Orders",
            "https://orders.example.com",
            SourceType::Openapi,
            AuthMode::None,
            Utc::now(),
        );
        repo.add(agg.clone()).await.unwrap();
        assert!(repo.add(agg).await.is_err());
    }

    #[tokio::test]
    async fn missing_aggregate_is_none_not_error() {
        let repo = InMemoryToolRepository::new();
        assert!(repo.get("orders:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_by_source_filters_and_sorts() {
        let repo = InMemoryToolRepository::new();
        for (source, name) in [("b", "z"), ("a", "y"), ("a", "x")] {
            let (agg, _) = ToolAggregate::discover(
                source,
                ToolDefinition {
                    name: name.into(),
                    ..Default::default()
                },
                Utc::now(),
            );
            repo.add(agg).await.unwrap();
        }
        let tools = repo.list_by_source("a").await.unwrap();
        let ids: Vec<_> = tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a:x", "a:y"]);
    }
}
