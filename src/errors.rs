use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Maximum number of bytes of an upstream response body carried in error details.
pub const MAX_UPSTREAM_BODY_BYTES: usize = 500;

/// Error kinds, classified by meaning rather than transport code.
///
/// The wire-facing `error_code` string is the lowercase snake form of the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    TemplateError,
    NotFound,
    Forbidden,
    Conflict,
    UpstreamTimeout,
    UpstreamConnectionError,
    UpstreamError,
    CircuitOpen,
    CircuitTesting,
    TokenExchangeFailed,
    ClientCredentialsFailed,
    OidcDiscoveryError,
    PollTimeout,
    InternalError,
}

impl ErrorKind {
    /// Wire-level error code string.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::TemplateError => "template_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamConnectionError => "upstream_connection_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::CircuitTesting => "circuit_testing",
            ErrorKind::TokenExchangeFailed => "token_exchange_failed",
            ErrorKind::ClientCredentialsFailed => "client_credentials_failed",
            ErrorKind::OidcDiscoveryError => "oidc_discovery_error",
            ErrorKind::PollTimeout => "poll_timeout",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP status this kind surfaces as at the API boundary.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ValidationError | ErrorKind::TemplateError => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::UpstreamTimeout
            | ErrorKind::UpstreamConnectionError
            | ErrorKind::UpstreamError
            | ErrorKind::CircuitOpen
            | ErrorKind::CircuitTesting
            | ErrorKind::PollTimeout => 503,
            ErrorKind::TokenExchangeFailed | ErrorKind::ClientCredentialsFailed => 401,
            ErrorKind::OidcDiscoveryError => 502,
            ErrorKind::InternalError => 500,
        }
    }

    /// Default retryability for this kind. Token exchange and OIDC discovery
    /// carry a per-instance flag instead, set from the IdP response.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamConnectionError
                | ErrorKind::UpstreamError
                | ErrorKind::CircuitOpen
                | ErrorKind::CircuitTesting
                | ErrorKind::PollTimeout
        )
    }
}

/// Boundary error for toolgate.
///
/// Use at module boundaries (token services, adapters, executor, orchestrator).
/// Leaf functions keep using `anyhow::Result`; conversion goes through
/// [`ToolgateError::internal`] so callers never lose the kind taxonomy.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .kind.code())]
pub struct ToolgateError {
    pub kind: ErrorKind,
    pub message: String,
    /// Non-sensitive context. Never contains credentials or subject tokens.
    pub details: BTreeMap<String, Value>,
    /// Travels with the error so clients can decide to retry automatically.
    pub retryable: bool,
    /// Upstream HTTP status, when one was observed.
    pub upstream_status: Option<u16>,
}

pub type ToolgateResult<T> = std::result::Result<T, ToolgateError>;

impl ToolgateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
            retryable: kind.default_retryable(),
            upstream_status: None,
        }
    }

    pub fn validation(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
            .with_detail("validation_errors", Value::from(errors))
    }

    pub fn template(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateError, message)
    }

    pub fn not_found(resource_type: &str, id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("{} '{}' not found", resource_type, id),
        )
        .with_detail("resource_type", Value::from(resource_type))
        .with_detail("resource_id", Value::from(id))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = Some(status);
        self
    }

    /// Attach a truncated upstream response body for debuggability.
    pub fn with_upstream_body(self, body: &str) -> Self {
        self.with_detail("upstream_body", Value::from(truncate_body(body)))
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn error_code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<anyhow::Error> for ToolgateError {
    fn from(err: anyhow::Error) -> Self {
        ToolgateError::internal(err.to_string())
    }
}

/// Truncate an upstream body to [`MAX_UPSTREAM_BODY_BYTES`] on a char boundary.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_UPSTREAM_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_UPSTREAM_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
