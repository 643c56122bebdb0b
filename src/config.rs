//! Typed settings for the gateway subsystems.
//!
//! Configuration *loading* is an external concern; these structs only define
//! the shape and defaults, and deserialize from whatever the host hands us.

use serde::{Deserialize, Serialize};

/// Circuit breaker tuning, one set shared by all breakers in a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,
    #[serde(
        default = "default_recovery_timeout_secs",
        rename = "recoveryTimeoutSecs"
    )]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls", rename = "halfOpenMaxCalls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Trusted IdP connection used for RFC 8693 token exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpSettings {
    #[serde(default, rename = "tokenUrl")]
    pub token_url: String,
    #[serde(default, rename = "clientId")]
    pub client_id: String,
    #[serde(default, rename = "clientSecret")]
    pub client_secret: String,
    #[serde(default = "default_token_timeout_secs", rename = "timeoutSecs")]
    pub timeout_secs: u64,
}

fn default_token_timeout_secs() -> u64 {
    10
}

impl Default for IdpSettings {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: default_token_timeout_secs(),
        }
    }
}

/// OIDC discovery cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcSettings {
    #[serde(default = "default_oidc_ttl_secs", rename = "cacheTtlSecs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_token_timeout_secs", rename = "httpTimeoutSecs")]
    pub http_timeout_secs: u64,
}

fn default_oidc_ttl_secs() -> u64 {
    3600
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_oidc_ttl_secs(),
            http_timeout_secs: default_token_timeout_secs(),
        }
    }
}

/// Token cache tuning shared by the exchanger and client-credentials services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheSettings {
    /// A token is treated as expired once `now + buffer >= expires_at`.
    #[serde(default = "default_expiry_buffer_secs", rename = "expiryBufferSecs")]
    pub expiry_buffer_secs: u64,
    /// Cache TTL never drops below this even for short-lived tokens.
    #[serde(default = "default_ttl_floor_secs", rename = "ttlFloorSecs")]
    pub ttl_floor_secs: u64,
    #[serde(default = "default_cache_capacity", rename = "capacity")]
    pub capacity: usize,
}

fn default_expiry_buffer_secs() -> u64 {
    60
}

fn default_ttl_floor_secs() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            expiry_buffer_secs: default_expiry_buffer_secs(),
            ttl_floor_secs: default_ttl_floor_secs(),
            capacity: default_cache_capacity(),
        }
    }
}

/// Tool executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_exec_timeout_secs", rename = "defaultTimeoutSecs")]
    pub default_timeout_secs: u64,
    /// Global toggle for argument validation; per-call override wins.
    #[serde(default = "default_true", rename = "validateArguments")]
    pub validate_arguments: bool,
    #[serde(default = "default_max_redirects", rename = "maxRedirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_poll_attempts", rename = "maxPollAttempts")]
    pub max_poll_attempts: u32,
}

fn default_exec_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_poll_attempts() -> u32 {
    60
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_exec_timeout_secs(),
            validate_arguments: true,
            max_redirects: default_max_redirects(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

/// Built-in tool runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinSettings {
    /// Root of per-user workspaces; defaults to `~/.toolgate/workspaces`.
    #[serde(default, rename = "workspaceRoot")]
    pub workspace_root: Option<std::path::PathBuf>,
    #[serde(default = "default_fetch_max_bytes", rename = "fetchMaxBytes")]
    pub fetch_max_bytes: usize,
    #[serde(default = "default_fetch_timeout_secs", rename = "fetchTimeoutSecs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_file_max_bytes", rename = "fileMaxBytes")]
    pub file_max_bytes: usize,
    /// Redis URL for the memory tool's primary store; file fallback when unset
    /// or unreachable.
    #[serde(default, rename = "memoryRedisUrl")]
    pub memory_redis_url: Option<String>,
    #[serde(default = "default_sandbox_timeout_secs", rename = "sandboxTimeoutSecs")]
    pub sandbox_timeout_secs: u64,
    #[serde(default = "default_workspace_ttl_hours", rename = "workspaceTtlHours")]
    pub workspace_ttl_hours: u64,
}

fn default_fetch_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

fn default_file_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_sandbox_timeout_secs() -> u64 {
    10
}

fn default_workspace_ttl_hours() -> u64 {
    24
}

impl Default for BuiltinSettings {
    fn default() -> Self {
        Self {
            workspace_root: None,
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            file_max_bytes: default_file_max_bytes(),
            memory_redis_url: None,
            sandbox_timeout_secs: default_sandbox_timeout_secs(),
            workspace_ttl_hours: default_workspace_ttl_hours(),
        }
    }
}

/// Top-level settings bundle handed to the gateway at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub idp: IdpSettings,
    #[serde(default)]
    pub oidc: OidcSettings,
    #[serde(default, rename = "tokenCache")]
    pub token_cache: TokenCacheSettings,
    #[serde(default, rename = "circuitBreaker")]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub builtins: BuiltinSettings,
}
