use crate::auth::token_cache::TokenCacheEntry;
use crate::config::{IdpSettings, TokenCacheSettings};
use crate::errors::{ErrorKind, ToolgateError, ToolgateResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

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

/// OAuth2 `client_credentials` grant for service-to-service auth.
///
/// Two modes: the service's own configured client, or a per-source triple
/// supplied by the caller. The cache is keyed on `(token_url, client_id)`
/// plus sorted scopes, so per-source clients never collide with the default.
pub struct ClientCredentialsService {
    http: reqwest::Client,
    default_idp: IdpSettings,
    cache_settings: TokenCacheSettings,
    cache: Mutex<HashMap<String, TokenCacheEntry>>,
}

impl ClientCredentialsService {
    pub fn new(
        http: reqwest::Client,
        default_idp: IdpSettings,
        cache_settings: TokenCacheSettings,
    ) -> Self {
        Self {
            http,
            default_idp,
            cache_settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Token using the service's own configured client.
    pub async fn get_token(&self, scopes: &[String]) -> ToolgateResult<TokenCacheEntry> {
        let idp = self.default_idp.clone();
        self.get_token_for(&idp.token_url, &idp.client_id, &idp.client_secret, scopes)
            .await
    }

    /// Token for an arbitrary `(token_url, client_id, client_secret)` triple.
    pub async fn get_token_for(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> ToolgateResult<TokenCacheEntry> {
        let cache_key = cache_key(token_url, client_id, scopes);
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&cache_key) {
                if !entry.is_expired(self.cache_settings.expiry_buffer_secs) {
                    debug!("client credentials cache hit for client '{}'", client_id);
                    return Ok(entry.clone());
                }
            }
        }

        let entry = self
            .fetch(token_url, client_id, client_secret, scopes)
            .await?;
        self.cache.lock().await.insert(cache_key, entry.clone());
        Ok(entry)
    }

    async fn fetch(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> ToolgateResult<TokenCacheEntry> {
        let scope = scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if !scope.is_empty() {
            form.push(("scope", &scope));
        }

        let response = self
            .http
            .post(token_url)
            .form(&form)
            .timeout(Duration::from_secs(self.default_idp.timeout_secs))
            .send()
            .await
            .map_err(|e| {
                ToolgateError::new(
                    ErrorKind::ClientCredentialsFailed,
                    format!("client credentials request failed: {}", e),
                )
                .with_retryable(e.is_timeout() || e.is_connect())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let idp_error: IdpErrorBody = serde_json::from_str(&body).unwrap_or_default();
            return Err(ToolgateError::new(
                ErrorKind::ClientCredentialsFailed,
                format!(
                    "client credentials grant for '{}' failed: {}",
                    client_id,
                    idp_error
                        .error_description
                        .or(idp_error.error)
                        .unwrap_or_else(|| status.to_string())
                ),
            )
            .with_retryable(status.is_server_error())
            .with_upstream_status(status.as_u16()));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            ToolgateError::new(
                ErrorKind::ClientCredentialsFailed,
                format!("token endpoint returned an unparsable body: {}", e),
            )
        })?;

        debug!(
            "client credentials grant succeeded for '{}' (expires_in: {}s)",
            client_id, token.expires_in
        );
        Ok(TokenCacheEntry::new(
            token.access_token,
            token.expires_in,
            token.token_type,
            token.scope,
        ))
    }

    /// Drop cached tokens: all of them, or only one client's.
    pub async fn clear_cache(&self, client_id: Option<&str>) -> usize {
        let mut cache = self.cache.lock().await;
        match client_id {
            None => {
                let count = cache.len();
                cache.clear();
                count
            }
            Some(client_id) => {
                let keys: Vec<String> = cache
                    .keys()
                    .filter(|key| key.split('|').nth(1) == Some(client_id))
                    .cloned()
                    .collect();
                for key in &keys {
                    cache.remove(key);
                }
                keys.len()
            }
        }
    }
}

fn cache_key(token_url: &str, client_id: &str, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    format!("{}|{}|{}", token_url, client_id, sorted.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(server: &MockServer) -> ClientCredentialsService {
        ClientCredentialsService::new(
            reqwest::Client::new(),
            IdpSettings {
                token_url: format!("{}/token", server.uri()),
                client_id: "toolgate".into(),
                client_secret: "s3cr3t".into(),
                timeout_secs: 5,
            },
            TokenCacheSettings::default(),
        )
    }

    #[tokio::test]
    async fn default_client_grant_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=toolgate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "svc-token",
                "expires_in": 600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = service(&server);
        let token = service.get_token(&[]).await.unwrap();
        assert_eq!(token.access_token, "svc-token");
        assert!(!token.is_expired(60));
        service.get_token(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn per_source_client_uses_its_own_cache_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "x",
                "expires_in": 600
            })))
            .expect(2)
            .mount(&server)
            .await;

        let service = service(&server);
        service.get_token(&[]).await.unwrap();
        service
            .get_token_for(
                &format!("{}/token", server.uri()),
                "per-source-client",
                "other-secret",
                &[],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_client_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "bad secret"
            })))
            .mount(&server)
            .await;

        let err = service(&server).get_token(&[]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ClientCredentialsFailed);
        assert!(!err.is_retryable());
        assert!(err.message.contains("bad secret"));
    }

    #[tokio::test]
    async fn clear_cache_by_client_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "x",
                "expires_in": 600
            })))
            .mount(&server)
            .await;

        let service = service(&server);
        service.get_token(&[]).await.unwrap();
        service
            .get_token_for(&format!("{}/token", server.uri()), "other", "s", &[])
            .await
            .unwrap();

        assert_eq!(service.clear_cache(Some("other")).await, 1);
        assert_eq!(service.clear_cache(None).await, 1);
    }
}
