use crate::auth::token_cache::{SharedTokenCache, TokenCacheEntry, exchange_cache_key};
use crate::breaker::CircuitBreakerRegistry;
use crate::config::{IdpSettings, TokenCacheSettings};
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use lru::LruCache;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// All exchanger traffic shares one breaker under this key.
const BREAKER_KEY: &str = "keycloak";
const BREAKER_CIRCUIT_TYPE: &str = "token_exchange";

const SHARED_KEY_PREFIX: &str = "toolgate:exchange:";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    scope: Option<String>,
}

fn default_expires_in() -> u64 {
    300
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct IdpErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// RFC 8693 token exchange against the trusted IdP.
///
/// Results are cached two-tier: a bounded in-process map plus an optional
/// shared cache. Shared-cache failures degrade to the in-process tier and
/// never fail the exchange.
pub struct TokenExchanger {
    http: reqwest::Client,
    idp: IdpSettings,
    cache_settings: TokenCacheSettings,
    local: Mutex<LruCache<String, TokenCacheEntry>>,
    shared: Option<Arc<dyn SharedTokenCache>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl TokenExchanger {
    pub fn new(
        http: reqwest::Client,
        idp: IdpSettings,
        cache_settings: TokenCacheSettings,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(cache_settings.capacity.max(1)).expect("capacity is at least 1");
        Self {
            http,
            idp,
            cache_settings,
            local: Mutex::new(LruCache::new(capacity)),
            shared: None,
            breakers,
        }
    }

    pub fn with_shared_cache(mut self, shared: Arc<dyn SharedTokenCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Exchange `subject_token` for a token scoped to `audience`.
    pub async fn exchange(
        &self,
        subject_token: &str,
        audience: &str,
        scopes: &[String],
    ) -> ToolgateResult<TokenCacheEntry> {
        let cache_key = exchange_cache_key(subject_token, audience, scopes);
        let buffer = self.cache_settings.expiry_buffer_secs;

        if let Some(entry) = self.local.lock().await.get(&cache_key) {
            if !entry.is_expired(buffer) {
                debug!("token exchange cache hit (audience: {})", audience);
                return Ok(entry.clone());
            }
        }
        if let Some(shared) = &self.shared {
            match shared.get(&format!("{}{}", SHARED_KEY_PREFIX, cache_key)).await {
                Ok(Some(entry)) if !entry.is_expired(buffer) => {
                    debug!("token exchange shared-cache hit (audience: {})", audience);
                    self.local.lock().await.put(cache_key, entry.clone());
                    return Ok(entry);
                }
                Ok(_) => {}
                Err(e) => warn!("shared token cache read failed, continuing: {}", e),
            }
        }

        let breaker = self
            .breakers
            .get_or_create(BREAKER_KEY, BREAKER_CIRCUIT_TYPE, BREAKER_KEY)
            .await;
        let entry = breaker
            .call(|| self.do_exchange(subject_token, audience, scopes))
            .await?;

        self.store(&cache_key, &entry).await;
        Ok(entry)
    }

    async fn do_exchange(
        &self,
        subject_token: &str,
        audience: &str,
        scopes: &[String],
    ) -> ToolgateResult<TokenCacheEntry> {
        let scope = scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", subject_token),
            ("subject_token_type", TOKEN_TYPE_ACCESS_TOKEN),
            ("requested_token_type", TOKEN_TYPE_ACCESS_TOKEN),
            ("audience", audience),
            ("client_id", &self.idp.client_id),
            ("client_secret", &self.idp.client_secret),
        ];
        if !scope.is_empty() {
            form.push(("scope", &scope));
        }

        let response = self
            .http
            .post(&self.idp.token_url)
            .form(&form)
            .timeout(Duration::from_secs(self.idp.timeout_secs))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let idp_error: IdpErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let error_code = idp_error.error.unwrap_or_else(|| "unknown_error".into());
            let retryable = status.is_server_error()
                || matches!(error_code.as_str(), "temporarily_unavailable" | "server_error");
            return Err(ToolgateError::new(
                ErrorKind::TokenExchangeFailed,
                format!(
                    "token exchange for audience '{}' failed: {}",
                    audience,
                    idp_error
                        .error_description
                        .as_deref()
                        .unwrap_or(error_code.as_str())
                ),
            )
            .with_retryable(retryable)
            .with_upstream_status(status.as_u16())
            .with_detail("error_code", error_code.into()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ToolgateError::new(
                ErrorKind::TokenExchangeFailed,
                format!("token endpoint returned an unparsable body: {}", e),
            )
            .with_retryable(false)
        })?;

        debug!(
            "token exchange succeeded (audience: {}, expires_in: {}s)",
            audience, token.expires_in
        );
        Ok(TokenCacheEntry::new(
            token.access_token,
            token.expires_in,
            token.token_type,
            token.scope,
        ))
    }

    async fn store(&self, cache_key: &str, entry: &TokenCacheEntry) {
        self.local
            .lock()
            .await
            .put(cache_key.to_string(), entry.clone());
        if let Some(shared) = &self.shared {
            let ttl = self.shared_ttl(entry);
            if let Err(e) = shared
                .set(&format!("{}{}", SHARED_KEY_PREFIX, cache_key), entry, ttl)
                .await
            {
                warn!("shared token cache write failed, continuing: {}", e);
            }
        }
    }

    /// Shared-tier TTL: time to expiry minus the buffer, floored.
    fn shared_ttl(&self, entry: &TokenCacheEntry) -> u64 {
        let remaining = (entry.expires_at - chrono::Utc::now()).num_seconds().max(0) as u64;
        remaining
            .saturating_sub(self.cache_settings.expiry_buffer_secs)
            .max(self.cache_settings.ttl_floor_secs)
    }

    /// Invalidate cached exchanges, optionally restricted to one audience.
    /// Returns the number of entries dropped from the in-process tier.
    pub async fn invalidate_cache(&self, audience: Option<&str>) -> usize {
        let mut local = self.local.lock().await;
        match audience {
            None => {
                let count = local.len();
                local.clear();
                count
            }
            Some(audience) => {
                let keys: Vec<String> = local
                    .iter()
                    .filter(|(key, _)| {
                        key.split('|').nth(1).is_some_and(|aud| aud == audience)
                    })
                    .map(|(key, _)| (*key).clone())
                    .collect();
                for key in &keys {
                    local.pop(key);
                }
                keys.len()
            }
        }
    }
}

fn transport_error(err: &reqwest::Error) -> ToolgateError {
    let message = if err.is_timeout() {
        "token exchange request timed out".to_string()
    } else if err.is_connect() {
        format!("could not connect to the token endpoint: {}", err)
    } else {
        format!("token exchange request failed: {}", err)
    };
    ToolgateError::new(ErrorKind::TokenExchangeFailed, message).with_retryable(true)
}
