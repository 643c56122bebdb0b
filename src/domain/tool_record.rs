use crate::domain::events::DomainEvent;
use crate::domain::tool::ToolDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Active,
    Deprecated,
    Deleted,
}

/// Persistent record of one tool bound to a source, keyed `source_id:name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAggregate {
    pub id: String,
    pub source_id: String,
    pub definition: ToolDefinition,
    pub is_enabled: bool,
    pub status: ToolStatus,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ToolAggregate {
    pub fn tool_id(source_id: &str, name: &str) -> String {
        format!("{}:{}", source_id, name)
    }

    /// Create a newly discovered tool (status ACTIVE).
    pub fn discover(
        source_id: impl Into<String>,
        definition: ToolDefinition,
        now: DateTime<Utc>,
    ) -> (Self, DomainEvent) {
        let source_id = source_id.into();
        let id = Self::tool_id(&source_id, &definition.name);
        let agg = Self {
            id: id.clone(),
            source_id: source_id.clone(),
            definition,
            is_enabled: true,
            status: ToolStatus::Active,
            label_ids: Vec::new(),
            discovered_at: now,
            last_seen_at: now,
            created_at: now,
            last_modified: now,
        };
        let event = DomainEvent::ToolDiscovered {
            tool_id: id,
            source_id,
            name: agg.definition.name.clone(),
            at: now,
        };
        (agg, event)
    }

    /// Replace the definition after upstream drift was detected.
    pub fn update_definition(
        &mut self,
        definition: ToolDefinition,
        now: DateTime<Utc>,
    ) -> Vec<DomainEvent> {
        if self.definition == definition {
            return Vec::new();
        }
        self.definition = definition;
        self.last_seen_at = now;
        self.last_modified = now;
        vec![DomainEvent::ToolDefinitionUpdated {
            tool_id: self.id.clone(),
            definition: Box::new(self.definition.clone()),
            at: now,
        }]
    }

    /// Touch the last-seen timestamp; emits no event.
    pub fn mark_seen(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
    }

    /// Tool missing from the latest discovery round. Not a deletion.
    pub fn deprecate(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if self.status != ToolStatus::Active {
            return Vec::new();
        }
        self.status = ToolStatus::Deprecated;
        self.last_modified = now;
        vec![DomainEvent::ToolDeprecated {
            tool_id: self.id.clone(),
            at: now,
        }]
    }

    /// A deprecated tool reappeared upstream; restore with the fresh definition.
    pub fn restore(&mut self, definition: ToolDefinition, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if self.status != ToolStatus::Deprecated {
            return Vec::new();
        }
        self.status = ToolStatus::Active;
        self.definition = definition;
        self.last_seen_at = now;
        self.last_modified = now;
        vec![DomainEvent::ToolRestored {
            tool_id: self.id.clone(),
            at: now,
        }]
    }

    /// Explicit admin deletion.
    pub fn delete(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if self.status == ToolStatus::Deleted {
            return Vec::new();
        }
        self.status = ToolStatus::Deleted;
        self.last_modified = now;
        vec![DomainEvent::ToolDeleted {
            tool_id: self.id.clone(),
            at: now,
        }]
    }

    pub fn enable(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if self.is_enabled {
            return Vec::new();
        }
        self.is_enabled = true;
        self.last_modified = now;
        vec![DomainEvent::ToolEnabled {
            tool_id: self.id.clone(),
            at: now,
        }]
    }

    pub fn disable(&mut self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        if !self.is_enabled {
            return Vec::new();
        }
        self.is_enabled = false;
        self.last_modified = now;
        vec![DomainEvent::ToolDisabled {
            tool_id: self.id.clone(),
            at: now,
        }]
    }
}
