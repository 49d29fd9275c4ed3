//! Presence store — soft state shared between hub instances.
//!
//! Backed by Redis when configured, with an in-process fallback so a single
//! hub keeps working when Redis is absent or down. Everything in here is
//! advisory: online hashes, capabilities, session scratch, proxy response
//! envelopes. The source of truth for "is this device connected right now"
//! is the in-process connection registry, never this store.

use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MemoryStore {
    scalars: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    fn get(&mut self, key: &str) -> Option<String> {
        match self.scalars.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                self.scalars.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

/// Key/value presence operations with transparent degradation: a failing
/// Redis call logs a warning and falls through to the in-process store.
#[derive(Clone)]
pub struct PresenceStore {
    redis: Option<redis::aio::ConnectionManager>,
    memory: Arc<Mutex<MemoryStore>>,
}

impl PresenceStore {
    /// Connect to Redis if a URL is configured; otherwise run in-process only.
    pub async fn connect(config: &perch_common::config::AppConfig) -> Self {
        let redis = match &config.redis.url {
            Some(url) => match Self::open(url).await {
                Ok(mgr) => {
                    tracing::info!("Connected to Redis");
                    Some(mgr)
                }
                Err(e) => {
                    tracing::warn!("Redis connection failed: {e}. Using in-process presence store.");
                    None
                }
            },
            None => {
                tracing::info!("PERCH__REDIS__URL not set — using in-process presence store");
                None
            }
        };

        Self {
            redis,
            memory: Arc::new(Mutex::new(MemoryStore::default())),
        }
    }

    async fn open(url: &str) -> Result<redis::aio::ConnectionManager, redis::RedisError> {
        let client = redis::Client::open(url)?;
        redis::aio::ConnectionManager::new(client).await
    }

    /// In-process-only store.
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            memory: Arc::new(Mutex::new(MemoryStore::default())),
        }
    }

    /// Set a scalar key, optionally with a TTL in seconds.
    pub async fn set_json(&self, key: &str, value: &Value, ttl_secs: Option<u64>) {
        let encoded = value.to_string();

        if let Some(mgr) = &self.redis {
            let mut conn = mgr.clone();
            let result: Result<(), redis::RedisError> = match ttl_secs {
                Some(ttl) => conn.set_ex(key, &encoded, ttl).await,
                None => conn.set(key, &encoded).await,
            };
            match result {
                Ok(()) => return,
                Err(e) => tracing::warn!(key, "Redis SET failed: {e}"),
            }
        }

        let deadline = ttl_secs.map(|ttl| Instant::now() + Duration::from_secs(ttl));
        self.memory
            .lock()
            .expect("presence store lock")
            .scalars
            .insert(key.to_string(), (encoded, deadline));
    }

    /// Get a scalar key.
    pub async fn get_json(&self, key: &str) -> Option<Value> {
        if let Some(mgr) = &self.redis {
            let mut conn = mgr.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => return value.and_then(|v| serde_json::from_str(&v).ok()),
                Err(e) => tracing::warn!(key, "Redis GET failed: {e}"),
            }
        }

        self.memory
            .lock()
            .expect("presence store lock")
            .get(key)
            .and_then(|v| serde_json::from_str(&v).ok())
    }

    /// Delete a scalar key.
    pub async fn delete(&self, key: &str) {
        if let Some(mgr) = &self.redis {
            let mut conn = mgr.clone();
            match conn.del::<_, ()>(key).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(key, "Redis DEL failed: {e}"),
            }
        }

        self.memory
            .lock()
            .expect("presence store lock")
            .scalars
            .remove(key);
    }

    /// Set a hash field.
    pub async fn hset_json(&self, name: &str, field: &str, value: &Value) {
        let encoded = value.to_string();

        if let Some(mgr) = &self.redis {
            let mut conn = mgr.clone();
            match conn.hset::<_, _, _, ()>(name, field, &encoded).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(name, field, "Redis HSET failed: {e}"),
            }
        }

        self.memory
            .lock()
            .expect("presence store lock")
            .hashes
            .entry(name.to_string())
            .or_default()
            .insert(field.to_string(), encoded);
    }

    /// Delete a hash field.
    pub async fn hdel(&self, name: &str, field: &str) {
        if let Some(mgr) = &self.redis {
            let mut conn = mgr.clone();
            match conn.hdel::<_, _, ()>(name, field).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(name, field, "Redis HDEL failed: {e}"),
            }
        }

        if let Some(hash) = self
            .memory
            .lock()
            .expect("presence store lock")
            .hashes
            .get_mut(name)
        {
            hash.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scalar_set_get_delete() {
        let store = PresenceStore::in_memory();
        store
            .set_json("session:s1", &json!({"user_id": 7}), None)
            .await;
        assert_eq!(
            store.get_json("session:s1").await,
            Some(json!({"user_id": 7}))
        );

        store.delete("session:s1").await;
        assert_eq!(store.get_json("session:s1").await, None);
    }

    #[tokio::test]
    async fn scalar_ttl_expires() {
        let store = PresenceStore::in_memory();
        store
            .set_json("proxy:response:r1", &json!({"status": 200}), Some(0))
            .await;
        assert_eq!(store.get_json("proxy:response:r1").await, None);

        store
            .set_json("proxy:response:r2", &json!({"status": 200}), Some(60))
            .await;
        assert!(store.get_json("proxy:response:r2").await.is_some());
    }

    #[tokio::test]
    async fn hash_fields_are_independent() {
        let store = PresenceStore::in_memory();
        store
            .hset_json("devices:online", "cam-1", &json!({"connected_at": "t"}))
            .await;
        store
            .hset_json("devices:online", "cam-2", &json!({"connected_at": "t"}))
            .await;

        store.hdel("devices:online", "cam-1").await;

        // cam-2 untouched
        let remaining = store
            .memory
            .lock()
            .unwrap()
            .hashes
            .get("devices:online")
            .unwrap()
            .clone();
        assert!(!remaining.contains_key("cam-1"));
        assert!(remaining.contains_key("cam-2"));
    }
}
