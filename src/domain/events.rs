use crate::domain::source::SourceType;
use crate::domain::tool::ToolDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain events emitted by the aggregates.
///
/// The event store itself is an external collaborator; this crate only
/// produces the typed facts to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SourceRegistered {
        source_id: String,
        name: String,
        url: String,
        source_type: SourceType,
        at: DateTime<Utc>,
    },
    SourceUpdated {
        source_id: String,
        at: DateTime<Utc>,
    },
    SourceEnabled {
        source_id: String,
        at: DateTime<Utc>,
    },
    SourceDisabled {
        source_id: String,
        at: DateTime<Utc>,
    },
    SourceSyncSucceeded {
        source_id: String,
        inventory_hash: String,
        tool_count: usize,
        at: DateTime<Utc>,
    },
    SourceSyncFailed {
        source_id: String,
        error: String,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    SourceDeleted {
        source_id: String,
        at: DateTime<Utc>,
    },
    ToolDiscovered {
        tool_id: String,
        source_id: String,
        name: String,
        at: DateTime<Utc>,
    },
    ToolDefinitionUpdated {
        tool_id: String,
        definition: Box<ToolDefinition>,
        at: DateTime<Utc>,
    },
    ToolDeprecated {
        tool_id: String,
        at: DateTime<Utc>,
    },
    ToolRestored {
        tool_id: String,
        at: DateTime<Utc>,
    },
    ToolEnabled {
        tool_id: String,
        at: DateTime<Utc>,
    },
    ToolDisabled {
        tool_id: String,
        at: DateTime<Utc>,
    },
    ToolDeleted {
        tool_id: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Aggregate id this event belongs to.
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainEvent::SourceRegistered { source_id, .. }
            | DomainEvent::SourceUpdated { source_id, .. }
            | DomainEvent::SourceEnabled { source_id, .. }
            | DomainEvent::SourceDisabled { source_id, .. }
            | DomainEvent::SourceSyncSucceeded { source_id, .. }
            | DomainEvent::SourceSyncFailed { source_id, .. }
            | DomainEvent::SourceDeleted { source_id, .. } => source_id,
            DomainEvent::ToolDiscovered { tool_id, .. }
            | DomainEvent::ToolDefinitionUpdated { tool_id, .. }
            | DomainEvent::ToolDeprecated { tool_id, .. }
            | DomainEvent::ToolRestored { tool_id, .. }
            | DomainEvent::ToolEnabled { tool_id, .. }
            | DomainEvent::ToolDisabled { tool_id, .. }
            | DomainEvent::ToolDeleted { tool_id, .. } => tool_id,
        }
    }
}
