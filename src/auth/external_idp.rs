use crate::auth::oidc::OidcDiscoveryCache;
use crate::auth::token_cache::{TokenCacheEntry, subject_token_hash};
use crate::config::TokenCacheSettings;
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

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

/// Tokens from identity providers *outside* the trusted IdP.
///
/// Discovery finds the token endpoint; the grant is then either client
/// credentials or RFC 8693 exchange. Unlike the trusted-IdP exchanger there
/// is no dedicated circuit breaker — external issuers are too numerous and
/// too transient to latch individually.
pub struct ExternalIdpProvider {
    http: reqwest::Client,
    oidc: Arc<OidcDiscoveryCache>,
    cache_settings: TokenCacheSettings,
    http_timeout_secs: u64,
    client_credentials_cache: Mutex<HashMap<String, TokenCacheEntry>>,
    token_exchange_cache: Mutex<HashMap<String, TokenCacheEntry>>,
}

impl ExternalIdpProvider {
    pub fn new(
        http: reqwest::Client,
        oidc: Arc<OidcDiscoveryCache>,
        cache_settings: TokenCacheSettings,
        http_timeout_secs: u64,
    ) -> Self {
        Self {
            http,
            oidc,
            cache_settings,
            http_timeout_secs,
            client_credentials_cache: Mutex::new(HashMap::new()),
            token_exchange_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Client-credentials token from an external issuer.
    pub async fn get_client_credentials_token(
        &self,
        issuer_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> ToolgateResult<TokenCacheEntry> {
        let cache_key = client_credentials_key(issuer_url, client_id, scopes);
        {
            let cache = self.client_credentials_cache.lock().await;
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_expired(self.cache_settings.expiry_buffer_secs) {
                    debug!("external IdP client-credentials cache hit for {}", issuer_url);
                    return Ok(entry.clone());
                }
            }
        }

        let token_endpoint = self.oidc.get_token_endpoint(issuer_url).await?;
        let scope = scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if !scope.is_empty() {
            form.push(("scope", &scope));
        }

        let entry = self
            .post_grant(&token_endpoint, &form, ErrorKind::ClientCredentialsFailed)
            .await?;
        self.client_credentials_cache
            .lock()
            .await
            .insert(cache_key, entry.clone());
        Ok(entry)
    }

    /// RFC 8693 exchange against an external issuer.
    pub async fn exchange_token(
        &self,
        issuer_url: &str,
        client_id: &str,
        client_secret: &str,
        subject_token: &str,
        audience: &str,
    ) -> ToolgateResult<TokenCacheEntry> {
        let cache_key = token_exchange_key(issuer_url, client_id, subject_token, audience);
        {
            let cache = self.token_exchange_cache.lock().await;
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_expired(self.cache_settings.expiry_buffer_secs) {
                    debug!("external IdP exchange cache hit for {}", issuer_url);
                    return Ok(entry.clone());
                }
            }
        }

        let document = self.oidc.get_document(issuer_url).await?;
        if document.supports_token_exchange() == Some(false) {
            // Advisory only: some IdPs omit the grant from their metadata but
            // still honor it.
            warn!(
                "issuer '{}' does not advertise token exchange; attempting anyway",
                issuer_url
            );
        }

        let form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", subject_token),
            ("subject_token_type", TOKEN_TYPE_ACCESS_TOKEN),
            ("requested_token_type", TOKEN_TYPE_ACCESS_TOKEN),
            ("audience", audience),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let entry = self
            .post_grant(
                &document.token_endpoint,
                &form,
                ErrorKind::TokenExchangeFailed,
            )
            .await?;
        self.token_exchange_cache
            .lock()
            .await
            .insert(cache_key, entry.clone());
        Ok(entry)
    }

    async fn post_grant(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
        failure_kind: ErrorKind,
    ) -> ToolgateResult<TokenCacheEntry> {
        let response = self
            .http
            .post(token_endpoint)
            .form(form)
            .timeout(Duration::from_secs(self.http_timeout_secs))
            .send()
            .await
            .map_err(|e| {
                ToolgateError::new(
                    failure_kind,
                    format!("external IdP request failed: {}", e),
                )
                .with_retryable(true)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error_code = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown_error".into());
            let retryable = status.is_server_error()
                || matches!(error_code.as_str(), "temporarily_unavailable" | "server_error");
            return Err(ToolgateError::new(
                failure_kind,
                format!("external IdP grant failed: {}", error_code),
            )
            .with_retryable(retryable)
            .with_upstream_status(status.as_u16())
            .with_detail("error_code", error_code.into()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ToolgateError::new(
                failure_kind,
                format!("external IdP returned an unparsable token body: {}", e),
            )
        })?;
        Ok(TokenCacheEntry::new(
            token.access_token,
            token.expires_in,
            token.token_type,
            token.scope,
        ))
    }

    pub async fn clear_caches(&self) {
        self.client_credentials_cache.lock().await.clear();
        self.token_exchange_cache.lock().await.clear();
    }
}

fn client_credentials_key(issuer_url: &str, client_id: &str, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    format!("{}|{}|{}", issuer_url, client_id, sorted.join(" "))
}

fn token_exchange_key(
    issuer_url: &str,
    client_id: &str,
    subject_token: &str,
    audience: &str,
) -> String {
    format!(
        "{}|{}|{}|{}",
        issuer_url,
        client_id,
        subject_token_hash(subject_token),
        audience
    )
}
