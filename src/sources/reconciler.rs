use crate::domain::{DomainEvent, ToolAggregate, ToolStatus};
use crate::sources::IngestionResult;
use crate::storage::{SourceRepository, ToolRepository};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshOutcome {
    pub tools_discovered: usize,
    pub tools_created: usize,
    pub tools_updated: usize,
    pub tools_deprecated: usize,
    pub tools_restored: usize,
    pub inventory_hash: String,
    pub source_version: Option<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    /// True when the inventory hash matched and nothing was touched.
    pub skipped: bool,
}

/// Diffs freshly discovered tools against the persisted aggregates and
/// applies create / update / touch / restore / deprecate transitions.
pub struct InventoryReconciler {
    sources: Arc<dyn SourceRepository>,
    tools: Arc<dyn ToolRepository>,
}

impl InventoryReconciler {
    pub fn new(sources: Arc<dyn SourceRepository>, tools: Arc<dyn ToolRepository>) -> Self {
        Self { sources, tools }
    }

    /// Reconcile one ingestion result into the stores.
    ///
    /// On adapter failure only the source's failure bookkeeping changes; no
    /// tool is modified. Returns the events emitted along the way so the
    /// caller can append them to the event store.
    pub async fn reconcile(
        &self,
        source_id: &str,
        ingestion: &IngestionResult,
        force: bool,
    ) -> anyhow::Result<(RefreshOutcome, Vec<DomainEvent>)> {
        let started = Instant::now();
        let now = Utc::now();
        let mut events = Vec::new();

        let mut source = self
            .sources
            .get(source_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("source '{}' not found", source_id))?;

        if !ingestion.success {
            let error = ingestion
                .error
                .clone()
                .unwrap_or_else(|| "ingestion failed".into());
            warn!("sync failed for source '{}': {}", source_id, error);
            events.extend(source.record_sync_failure(error, now));
            self.sources.update(source).await?;
            return Ok((
                RefreshOutcome {
                    warnings: ingestion.warnings.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ..Default::default()
                },
                events,
            ));
        }

        // Unchanged inventory short-circuits unless the refresh is forced.
        if !force && source.inventory_hash.as_deref() == Some(ingestion.inventory_hash.as_str()) {
            debug!(
                "inventory for '{}' unchanged (hash {}), skipping",
                source_id, ingestion.inventory_hash
            );
            events.extend(source.record_sync_success(
                ingestion.inventory_hash.clone(),
                ingestion.tools.len(),
                now,
            ));
            self.sources.update(source).await?;
            return Ok((
                RefreshOutcome {
                    tools_discovered: ingestion.tools.len(),
                    inventory_hash: ingestion.inventory_hash.clone(),
                    source_version: ingestion.source_version.clone(),
                    warnings: ingestion.warnings.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    skipped: true,
                    ..Default::default()
                },
                events,
            ));
        }

        let mut outcome = RefreshOutcome {
            tools_discovered: ingestion.tools.len(),
            inventory_hash: ingestion.inventory_hash.clone(),
            source_version: ingestion.source_version.clone(),
            warnings: ingestion.warnings.clone(),
            ..Default::default()
        };

        let mut seen: HashSet<String> = HashSet::new();
        for definition in &ingestion.tools {
            let tool_id = ToolAggregate::tool_id(source_id, &definition.name);
            seen.insert(tool_id.clone());

            match self.tools.get(&tool_id).await? {
                None => {
                    let (aggregate, event) =
                        ToolAggregate::discover(source_id, definition.clone(), now);
                    self.tools.add(aggregate).await?;
                    events.push(event);
                    outcome.tools_created += 1;
                }
                Some(mut existing) => {
                    if existing.status == ToolStatus::Deprecated {
                        let restored = existing.restore(definition.clone(), now);
                        if !restored.is_empty() {
                            events.extend(restored);
                            outcome.tools_restored += 1;
                        }
                        self.tools.update(existing).await?;
                    } else if existing.definition != *definition {
                        events.extend(existing.update_definition(definition.clone(), now));
                        self.tools.update(existing).await?;
                        outcome.tools_updated += 1;
                    } else {
                        // Equal definition: touch only, no event.
                        existing.mark_seen(now);
                        self.tools.update(existing).await?;
                    }
                }
            }
        }

        // Anything persisted but absent from this round is deprecated, never
        // deleted — deletion stays an explicit admin action.
        for mut aggregate in self.tools.list_by_source(source_id).await? {
            if seen.contains(&aggregate.id) || aggregate.status != ToolStatus::Active {
                continue;
            }
            events.extend(aggregate.deprecate(now));
            self.tools.update(aggregate).await?;
            outcome.tools_deprecated += 1;
        }

        events.extend(source.record_sync_success(
            ingestion.inventory_hash.clone(),
            ingestion.tools.len(),
            now,
        ));
        self.sources.update(source).await?;

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "reconciled source '{}': {} discovered, {} created, {} updated, {} deprecated, {} restored",
            source_id,
            outcome.tools_discovered,
            outcome.tools_created,
            outcome.tools_updated,
            outcome.tools_deprecated,
            outcome.tools_restored,
        );
        Ok((outcome, events))
    }

    /// Deprecate every active tool of a source (used by the delete cascade).
    pub async fn deprecate_all(&self, source_id: &str) -> anyhow::Result<Vec<DomainEvent>> {
        let now = Utc::now();
        let mut events = Vec::new();
        for mut aggregate in self.tools.list_by_source(source_id).await? {
            if aggregate.status == ToolStatus::Active {
                events.extend(aggregate.deprecate(now));
                self.tools.update(aggregate).await?;
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SourceAggregate, ToolDefinition};
    use crate::sources::IngestionResult;
    use crate::storage::{InMemorySourceRepository, InMemoryToolRepository};

    fn source_fixture(source_id: &str) -> SourceAggregate {
        SourceAggregate::register(
            source_id,
            source_id,
            format!("https://{}.example.com", source_id),
            crate::domain::SourceType::Openapi,
            crate::domain::AuthMode::None,
            Utc::now(),
        )
        .0
    }

    fn definition(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    async fn setup() -> (InventoryReconciler, Arc<InMemorySourceRepository>, Arc<InMemoryToolRepository>) {
        let sources = InMemorySourceRepository::new();
        let tools = InMemoryToolRepository::new();
        sources.add(source_fixture("orders")).await.unwrap();
        (
            InventoryReconciler::new(sources.clone(), tools.clone()),
            sources,
            tools,
        )
    }

    #[tokio::test]
    async fn first_sync_creates_everything() {
        let (reconciler, sources, tools) = setup().await;
        let ingestion = IngestionResult::ok(
            vec![definition("get_order", "a"), definition("list_orders", "b")],
            Some("1.0".into()),
            Vec::new(),
        );

        let (outcome, events) = reconciler.reconcile("orders", &ingestion, false).await.unwrap();
        assert_eq!(outcome.tools_created, 2);
        assert_eq!(outcome.tools_deprecated, 0);
        assert!(!outcome.skipped);
        assert!(events.iter().any(|e| matches!(e, DomainEvent::ToolDiscovered { .. })));

        let stored = tools.list_by_source("orders").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, "orders:get_order");

        let source = sources.get("orders").await.unwrap().unwrap();
        assert_eq!(source.inventory_hash.as_deref(), Some(outcome.inventory_hash.as_str()));
        assert_eq!(source.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn unchanged_hash_skips_without_tool_events() {
        let (reconciler, _, _) = setup().await;
        let ingestion = IngestionResult::ok(vec![definition("get_order", "a")], None, Vec::new());

        reconciler.reconcile("orders", &ingestion, false).await.unwrap();
        let (outcome, events) = reconciler.reconcile("orders", &ingestion, false).await.unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.tools_created, 0);
        assert_eq!(outcome.tools_updated, 0);
        assert_eq!(outcome.tools_deprecated, 0);
        // Only the source bookkeeping event remains.
        assert!(events.iter().all(|e| matches!(e, DomainEvent::SourceSyncSucceeded { .. })));
    }

    #[tokio::test]
    async fn forced_refresh_walks_tools_even_when_hash_matches() {
        let (reconciler, _, _) = setup().await;
        let ingestion = IngestionResult::ok(vec![definition("get_order", "a")], None, Vec::new());

        reconciler.reconcile("orders", &ingestion, false).await.unwrap();
        let (outcome, _) = reconciler.reconcile("orders", &ingestion, true).await.unwrap();
        assert!(!outcome.skipped);
        // Same definitions: a touch, not an update.
        assert_eq!(outcome.tools_updated, 0);
    }

    #[tokio::test]
    async fn drift_updates_and_absence_deprecates() {
        let (reconciler, _, tools) = setup().await;
        let first = IngestionResult::ok(
            vec![definition("get_order", "a"), definition("list_orders", "b")],
            None,
            Vec::new(),
        );
        reconciler.reconcile("orders", &first, false).await.unwrap();

        let second = IngestionResult::ok(
            vec![definition("get_order", "a CHANGED")],
            None,
            Vec::new(),
        );
        let (outcome, events) = reconciler.reconcile("orders", &second, false).await.unwrap();
        assert_eq!(outcome.tools_updated, 1);
        assert_eq!(outcome.tools_deprecated, 1);
        assert!(events.iter().any(|e| matches!(e, DomainEvent::ToolDeprecated { .. })));

        let list_orders = tools.get("orders:list_orders").await.unwrap().unwrap();
        assert_eq!(list_orders.status, ToolStatus::Deprecated);
    }

    #[tokio::test]
    async fn reappearing_tool_is_restored() {
        let (reconciler, _, tools) = setup().await;
        let both = IngestionResult::ok(
            vec![definition("get_order", "a"), definition("list_orders", "b")],
            None,
            Vec::new(),
        );
        reconciler.reconcile("orders", &both, false).await.unwrap();

        let only_one = IngestionResult::ok(vec![definition("get_order", "a")], None, Vec::new());
        reconciler.reconcile("orders", &only_one, false).await.unwrap();

        let (outcome, events) = reconciler.reconcile("orders", &both, false).await.unwrap();
        assert_eq!(outcome.tools_restored, 1);
        assert!(events.iter().any(|e| matches!(e, DomainEvent::ToolRestored { .. })));
        let restored = tools.get("orders:list_orders").await.unwrap().unwrap();
        assert_eq!(restored.status, ToolStatus::Active);
    }

    #[tokio::test]
    async fn adapter_failure_touches_only_the_source() {
        let (reconciler, sources, tools) = setup().await;
        let good = IngestionResult::ok(vec![definition("get_order", "a")], None, Vec::new());
        reconciler.reconcile("orders", &good, false).await.unwrap();

        let failure = IngestionResult::failure("connect refused");
        let (outcome, events) = reconciler.reconcile("orders", &failure, false).await.unwrap();
        assert_eq!(outcome.tools_deprecated, 0);
        assert!(events.iter().any(|e| matches!(e, DomainEvent::SourceSyncFailed { .. })));

        let source = sources.get("orders").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 1);
        assert_eq!(source.last_sync_error.as_deref(), Some("connect refused"));
        // Tools untouched.
        let tool = tools.get("orders:get_order").await.unwrap().unwrap();
        assert_eq!(tool.status, ToolStatus::Active);
    }

    #[tokio::test]
    async fn deprecate_all_supports_the_delete_cascade() {
        let (reconciler, _, tools) = setup().await;
        let both = IngestionResult::ok(
            vec![definition("get_order", "a"), definition("list_orders", "b")],
            None,
            Vec::new(),
        );
        reconciler.reconcile("orders", &both, false).await.unwrap();

        let events = reconciler.deprecate_all("orders").await.unwrap();
        assert_eq!(events.len(), 2);
        for tool in tools.list_by_source("orders").await.unwrap() {
            assert_eq!(tool.status, ToolStatus::Deprecated);
        }
    }
}
