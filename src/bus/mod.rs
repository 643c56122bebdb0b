//! Command bus façade: typed commands dispatched to registered handlers,
//! every result wrapped in a uniform [`OperationResult`]. This is the only
//! shape crossing the API boundary.

pub mod commands;
pub mod handlers;

use crate::errors::{ErrorKind, ToolgateError};
use async_trait::async_trait;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A typed command with its expected result type.
pub trait Command: Send + 'static {
    type Output: Send + 'static;
}

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: C) -> OperationResult<C::Output>;
}

/// Uniform operation outcome. Error variants may carry a data payload
/// alongside the status (e.g. a failed execution result).
#[derive(Debug)]
pub enum OperationResult<T> {
    Ok(T),
    BadRequest { detail: String, data: Option<T> },
    NotFound { resource_type: String, id: String },
    Conflict { message: String },
    Forbidden { message: String },
    InternalError { message: String },
    ServiceUnavailable { message: String },
}

impl<T> OperationResult<T> {
    pub fn ok(data: T) -> Self {
        OperationResult::Ok(data)
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        OperationResult::BadRequest {
            detail: detail.into(),
            data: None,
        }
    }

    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        OperationResult::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        OperationResult::Conflict {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        OperationResult::Forbidden {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        OperationResult::InternalError {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        OperationResult::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// HTTP status this outcome surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            OperationResult::Ok(_) => 200,
            OperationResult::BadRequest { .. } => 400,
            OperationResult::NotFound { .. } => 404,
            OperationResult::Conflict { .. } => 409,
            OperationResult::Forbidden { .. } => 403,
            OperationResult::InternalError { .. } => 500,
            OperationResult::ServiceUnavailable { .. } => 503,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, OperationResult::Ok(_))
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            OperationResult::Ok(data) => Some(data),
            OperationResult::BadRequest { data, .. } => data,
            _ => None,
        }
    }

    /// Map a boundary error onto the matching variant.
    pub fn from_error(err: ToolgateError) -> Self {
        match err.kind {
            ErrorKind::NotFound => {
                let resource_type = err
                    .details
                    .get("resource_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("resource")
                    .to_string();
                let id = err
                    .details
                    .get("resource_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                OperationResult::NotFound { resource_type, id }
            }
            ErrorKind::ValidationError | ErrorKind::TemplateError => {
                OperationResult::bad_request(err.message)
            }
            ErrorKind::Conflict => OperationResult::conflict(err.message),
            ErrorKind::Forbidden => OperationResult::forbidden(err.message),
            ErrorKind::UpstreamTimeout
            | ErrorKind::UpstreamConnectionError
            | ErrorKind::UpstreamError
            | ErrorKind::CircuitOpen
            | ErrorKind::CircuitTesting
            | ErrorKind::PollTimeout => OperationResult::service_unavailable(err.message),
            _ => OperationResult::internal_error(err.message),
        }
    }
}

/// Dispatches commands to the handler registered for their type.
#[derive(Default)]
pub struct CommandBus {
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Command>(&mut self, handler: Arc<dyn CommandHandler<C>>) {
        self.handlers.insert(TypeId::of::<C>(), Box::new(handler));
    }

    pub async fn execute<C: Command>(&self, command: C) -> OperationResult<C::Output> {
        let Some(handler) = self
            .handlers
            .get(&TypeId::of::<C>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn CommandHandler<C>>>())
        else {
            return OperationResult::internal_error(format!(
                "no handler registered for {}",
                type_name::<C>()
            ));
        };
        debug!("dispatching {}", type_name::<C>());
        handler.handle(command).await
    }
}
