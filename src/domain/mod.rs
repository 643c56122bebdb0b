//! Core data model: normalized tool definitions, source and tool aggregates,
//! and the domain events they emit.
//!
//! Aggregates are pure state-and-event pairs: methods mutate in-memory state
//! and return typed events; persistence is an external collaborator.

pub mod auth;
pub mod events;
pub mod source;
pub mod tool;
pub mod tool_record;

pub use auth::AuthConfig;
pub use events::DomainEvent;
pub use source::{
    AuthMode, HealthStatus, LifecycleMode, McpSourceConfig, McpTransport, SourceAggregate,
    SourceType, SourceUpdate,
};
pub use tool::{ExecutionMode, ExecutionProfile, PollConfig, ToolDefinition};
pub use tool_record::{ToolAggregate, ToolStatus};
