use crate::config::OidcSettings;
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The subset of `.well-known/openid-configuration` this system consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub grant_types_supported: Option<Vec<String>>,
}

impl DiscoveryDocument {
    /// Whether the issuer advertises RFC 8693. `None` when the document does
    /// not list grant types at all — advisory only; callers may still try.
    pub fn supports_token_exchange(&self) -> Option<bool> {
        self.grant_types_supported.as_ref().map(|grants| {
            grants
                .iter()
                .any(|g| g == "urn:ietf:params:oauth:grant-type:token-exchange")
        })
    }
}

struct CacheEntry {
    document: DiscoveryDocument,
    fetched_at: Instant,
}

/// Fetches and memoizes OIDC discovery documents, keyed by normalized issuer
/// (trailing slash stripped). Entries are evicted lazily on access.
pub struct OidcDiscoveryCache {
    http: reqwest::Client,
    settings: OidcSettings,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl OidcDiscoveryCache {
    pub fn new(http: reqwest::Client, settings: OidcSettings) -> Self {
        Self {
            http,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_document(&self, issuer_url: &str) -> ToolgateResult<DiscoveryDocument> {
        let issuer = normalize_issuer(issuer_url);
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&issuer) {
                if entry.fetched_at.elapsed() < Duration::from_secs(self.settings.cache_ttl_secs) {
                    debug!("OIDC discovery cache hit for {}", issuer);
                    return Ok(entry.document.clone());
                }
                cache.remove(&issuer);
            }
        }

        // The fetch runs outside the lock; concurrent misses may fetch twice,
        // last write wins.
        let document = self.fetch(&issuer).await?;
        self.cache.lock().await.insert(
            issuer.clone(),
            CacheEntry {
                document: document.clone(),
                fetched_at: Instant::now(),
            },
        );
        info!("OIDC discovery document cached for {}", issuer);
        Ok(document)
    }

    pub async fn get_token_endpoint(&self, issuer_url: &str) -> ToolgateResult<String> {
        Ok(self.get_document(issuer_url).await?.token_endpoint)
    }

    pub async fn get_jwks_uri(&self, issuer_url: &str) -> ToolgateResult<String> {
        Ok(self.get_document(issuer_url).await?.jwks_uri)
    }

    /// Invalidate one issuer, or everything when `None`.
    pub async fn clear_cache(&self, issuer_url: Option<&str>) {
        let mut cache = self.cache.lock().await;
        match issuer_url {
            Some(issuer) => {
                cache.remove(&normalize_issuer(issuer));
            }
            None => cache.clear(),
        }
    }

    async fn fetch(&self, issuer: &str) -> ToolgateResult<DiscoveryDocument> {
        let discovery_url = format!("{}/.well-known/openid-configuration", issuer);
        debug!("fetching OIDC discovery document from {}", discovery_url);

        let response = self
            .http
            .get(&discovery_url)
            .timeout(Duration::from_secs(self.settings.http_timeout_secs))
            .send()
            .await
            .map_err(|e| transport_error(issuer, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.is_server_error();
            let body = response.text().await.unwrap_or_default();
            return Err(ToolgateError::new(
                ErrorKind::OidcDiscoveryError,
                format!("discovery endpoint for '{}' returned {}", issuer, status),
            )
            .with_retryable(retryable)
            .with_upstream_status(status.as_u16())
            .with_upstream_body(&body));
        }

        let document: DiscoveryDocument = response.json().await.map_err(|e| {
            ToolgateError::new(
                ErrorKind::OidcDiscoveryError,
                format!("discovery document for '{}' is not valid: {}", issuer, e),
            )
            .with_retryable(false)
        })?;

        if document.issuer.is_empty()
            || document.token_endpoint.is_empty()
            || document.jwks_uri.is_empty()
        {
            return Err(ToolgateError::new(
                ErrorKind::OidcDiscoveryError,
                format!("discovery document for '{}' is missing required fields", issuer),
            )
            .with_retryable(false));
        }

        if normalize_issuer(&document.issuer) != issuer {
            warn!(
                "discovery document issuer '{}' does not match requested '{}'",
                document.issuer, issuer
            );
        }

        Ok(document)
    }
}

fn normalize_issuer(issuer_url: &str) -> String {
    issuer_url.trim_end_matches('/').to_string()
}

fn transport_error(issuer: &str, err: &reqwest::Error) -> ToolgateError {
    let message = if err.is_timeout() {
        format!("discovery request to '{}' timed out", issuer)
    } else {
        format!("discovery request to '{}' failed: {}", issuer, err)
    };
    ToolgateError::new(ErrorKind::OidcDiscoveryError, message).with_retryable(true)
}
