use crate::builtins::workspace::Workspace;
use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, optional_u64, required_str};
use crate::config::BuiltinSettings;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const MEMORY_FILE: &str = "memory.json";
const REDIS_PREFIX: &str = "toolgate:memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryEntry {
    value: Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Key/value store scoped to `user_id`.
///
/// Redis is the primary store when configured; the per-user workspace file
/// is the fallback when Redis is absent or unreachable. Concurrent access
/// for one user may interleave — treat the store as eventually consistent.
pub struct MemoryStore {
    redis: Option<redis::Client>,
    workspace: Arc<Workspace>,
}

impl MemoryStore {
    pub fn new(settings: &BuiltinSettings, workspace: Arc<Workspace>) -> Self {
        let redis = settings.memory_redis_url.as_deref().and_then(|url| {
            match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("invalid redis url for memory store, using file fallback: {}", e);
                    None
                }
            }
        });
        Self { redis, workspace }
    }

    pub async fn set(
        &self,
        user_id: &str,
        key: &str,
        value: Value,
        ttl_days: Option<u64>,
    ) -> Result<(), String> {
        let entry = MemoryEntry {
            value,
            expires_at: ttl_days.map(|days| Utc::now() + Duration::days(days as i64)),
        };
        if let Some(client) = &self.redis {
            match self.redis_set(client, user_id, key, &entry, ttl_days).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("redis memory store unavailable, falling back to file: {}", e),
            }
        }
        self.file_set(user_id, key, entry).await
    }

    pub async fn get(&self, user_id: &str, key: &str) -> Result<Option<Value>, String> {
        if let Some(client) = &self.redis {
            match self.redis_get(client, user_id, key).await {
                Ok(found @ Some(_)) => return Ok(found),
                Ok(None) => {}
                Err(e) => warn!("redis memory store unavailable, falling back to file: {}", e),
            }
        }
        self.file_get(user_id, key).await
    }

    pub async fn list_keys(&self, user_id: &str) -> Result<Vec<String>, String> {
        // Listing is served from the file tier; redis keys carry a TTL and
        // converge with it.
        let entries = self.load_file(user_id).await?;
        Ok(entries
            .into_iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key)
            .collect())
    }

    async fn redis_set(
        &self,
        client: &redis::Client,
        user_id: &str,
        key: &str,
        entry: &MemoryEntry,
        ttl_days: Option<u64>,
    ) -> anyhow::Result<()> {
        use redis::AsyncCommands;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let redis_key = format!("{}:{}:{}", REDIS_PREFIX, user_id, key);
        let payload = serde_json::to_string(entry)?;
        match ttl_days {
            Some(days) => conn.set_ex::<_, _, ()>(redis_key, payload, days * 86_400).await?,
            None => conn.set::<_, _, ()>(redis_key, payload).await?,
        }
        Ok(())
    }

    async fn redis_get(
        &self,
        client: &redis::Client,
        user_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<Value>> {
        use redis::AsyncCommands;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let redis_key = format!("{}:{}:{}", REDIS_PREFIX, user_id, key);
        let payload: Option<String> = conn.get(redis_key).await?;
        Ok(payload
            .and_then(|p| serde_json::from_str::<MemoryEntry>(&p).ok())
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value))
    }

    async fn load_file(&self, user_id: &str) -> Result<BTreeMap<String, MemoryEntry>, String> {
        let path = self
            .workspace
            .user_dir(user_id)
            .map_err(|e| e.to_string())?
            .join(MEMORY_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("cannot read memory file: {}", e))?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    async fn save_file(
        &self,
        user_id: &str,
        entries: &BTreeMap<String, MemoryEntry>,
    ) -> Result<(), String> {
        let path = self
            .workspace
            .user_dir(user_id)
            .map_err(|e| e.to_string())?
            .join(MEMORY_FILE);
        let content = serde_json::to_string_pretty(entries).map_err(|e| e.to_string())?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| format!("cannot write memory file: {}", e))
    }

    async fn file_set(&self, user_id: &str, key: &str, entry: MemoryEntry) -> Result<(), String> {
        let mut entries = self.load_file(user_id).await?;
        entries.retain(|_, e| !e.is_expired());
        entries.insert(key.to_string(), entry);
        self.save_file(user_id, &entries).await
    }

    async fn file_get(&self, user_id: &str, key: &str) -> Result<Option<Value>, String> {
        let entries = self.load_file(user_id).await?;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }
}

pub struct MemoryStoreTool {
    store: Arc<MemoryStore>,
}

impl MemoryStoreTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BuiltinTool for MemoryStoreTool {
    fn name(&self) -> &str {
        "memory_store"
    }

    fn description(&self) -> &str {
        "Store a value under a key in the user's persistent memory, with an optional TTL in days."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {"description": "Any JSON value to remember"},
                "ttl_days": {"type": "integer", "minimum": 1}
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        let key = match required_str(arguments, "key") {
            Ok(k) => k,
            Err(e) => return BuiltinToolResult::err(e),
        };
        let Some(value) = arguments.get("value") else {
            return BuiltinToolResult::err("missing required argument 'value'");
        };
        let ttl_days = optional_u64(arguments, "ttl_days");

        match self.store.set(&user.user_id, key, value.clone(), ttl_days).await {
            Ok(()) => {
                debug!("stored memory key '{}' for user '{}'", key, user.user_id);
                BuiltinToolResult::ok(json!({"key": key, "stored": true, "ttl_days": ttl_days}))
            }
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}

pub struct MemoryRetrieveTool {
    store: Arc<MemoryStore>,
}

impl MemoryRetrieveTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BuiltinTool for MemoryRetrieveTool {
    fn name(&self) -> &str {
        "memory_retrieve"
    }

    fn description(&self) -> &str {
        "Retrieve a value from the user's persistent memory, or list stored keys when no key is given."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Key to retrieve; omit to list keys"}
            }
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, user: &UserContext) -> BuiltinToolResult {
        match arguments.get("key").and_then(Value::as_str) {
            Some(key) => match self.store.get(&user.user_id, key).await {
                Ok(Some(value)) => BuiltinToolResult::ok(json!({"key": key, "value": value})),
                Ok(None) => BuiltinToolResult::err(format!("no memory stored under '{}'", key)),
                Err(e) => BuiltinToolResult::err(e),
            },
            None => match self.store.list_keys(&user.user_id).await {
                Ok(keys) => BuiltinToolResult::ok(json!({"keys": keys})),
                Err(e) => BuiltinToolResult::err(e),
            },
        }
    }
}
