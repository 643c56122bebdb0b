use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cached upstream credential. Ephemeral; never persisted to event storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCacheEntry {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenCacheEntry {
    pub fn new(
        access_token: impl Into<String>,
        expires_in_secs: u64,
        token_type: impl Into<String>,
        scope: Option<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs as i64),
            token_type: token_type.into(),
            scope,
        }
    }

    /// Expired once `now + buffer >= expires_at`.
    pub fn is_expired(&self, buffer_secs: u64) -> bool {
        Utc::now() + Duration::seconds(buffer_secs as i64) >= self.expires_at
    }
}

/// Optional second cache tier shared across processes (same entry shape).
///
/// Read or write failures must never fail the request; callers degrade to the
/// in-process tier.
#[async_trait]
pub trait SharedTokenCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<TokenCacheEntry>>;
    async fn set(&self, key: &str, entry: &TokenCacheEntry, ttl_secs: u64) -> anyhow::Result<()>;
}

/// Shared tier backed by Redis. Entries are stored as JSON with a server-side
/// TTL; any connectivity problem surfaces as an error and the caller falls
/// back to its in-process tier.
pub struct RedisTokenCache {
    client: redis::Client,
}

impl RedisTokenCache {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl SharedTokenCache for RedisTokenCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<TokenCacheEntry>> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(key).await?;
        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn set(&self, key: &str, entry: &TokenCacheEntry, ttl_secs: u64) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(entry)?;
        conn.set_ex::<_, _, ()>(key, payload, ttl_secs).await?;
        Ok(())
    }
}

/// First 16 hex chars of the subject token's SHA-256. The subject token
/// itself is never used as a cache key.
pub fn subject_token_hash(subject_token: &str) -> String {
    let digest = Sha256::digest(subject_token.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Cache key for the trusted-IdP exchanger: `hash|audience|sorted scopes`.
pub fn exchange_cache_key(subject_token: &str, audience: &str, scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    format!(
        "{}|{}|{}",
        subject_token_hash(subject_token),
        audience,
        sorted.join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_uses_buffer() {
        let entry = TokenCacheEntry::new("t", 120, "Bearer", None);
        assert!(!entry.is_expired(60));
        assert!(entry.is_expired(121));
    }

    #[test]
    fn hash_is_stable_and_short() {
        let a = subject_token_hash("ey.token.a");
        assert_eq!(a.len(), 16);
        assert_eq!(a, subject_token_hash("ey.token.a"));
        assert_ne!(a, subject_token_hash("ey.token.b"));
    }

    #[test]
    fn cache_key_sorts_scopes_and_never_embeds_token() {
        let token = "secret-subject-token";
        let key = exchange_cache_key(
            token,
            "order-api",
            &["write".to_string(), "read".to_string()],
        );
        assert!(!key.contains(token));
        assert!(key.ends_with("|order-api|read write"));
        assert_eq!(
            key,
            exchange_cache_key(token, "order-api", &["read".to_string(), "write".to_string()])
        );
    }
}
