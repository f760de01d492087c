//! Cache store contract and the in-memory implementation.
//!
//! The invocation layer only needs four operations from a store: `get`, `set`
//! with an optional TTL, `remove`, and enumeration of live entries. Any
//! persistence backend can implement [`CacheStore`]; [`MemoryStore`] keeps
//! entries in a bounded [`moka`] cache with per-entry expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::StoreError;

/// A live entry as reported by [`CacheStore::entries`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub key: String,
    pub value: Value,
    pub ttl: Option<Duration>,
}

/// Key/value store backing the cache.
///
/// Absence is not an error: `get` returns `Ok(None)` and `remove` returns
/// `Ok(false)` for unknown keys.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, replacing any previous entry. `None` keeps
    /// the entry until it is removed or evicted.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Returns `true` if an entry was removed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn entries(&self) -> Result<Vec<StoreEntry>, StoreError>;
}

/// Settings owned by the store itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// When `false` every read misses and every write is dropped.
    pub enabled: bool,
    pub max_entries: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: Value,
    ttl: Option<Duration>,
}

// Each entry expires after its own TTL; an overwrite restarts the clock.
struct PerEntryTtl;

impl Expiry<String, Stored> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Stored, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process [`CacheStore`] built on [`moka::future::Cache`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use callcache::store::{CacheStore, MemoryStore};
/// use serde_json::json;
///
/// # async fn example() {
/// let store = MemoryStore::default();
/// store.set("IUserApi.GetUser(id:1)", json!({"id": 1}), Some(Duration::from_secs(60))).await.unwrap();
/// assert!(store.get("IUserApi.GetUser(id:1)").await.unwrap().is_some());
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, Stored>,
    enabled: bool,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        info!(
            enabled = config.enabled,
            max_entries = config.max_entries,
            "initializing in-memory cache store"
        );
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if !self.enabled {
            return Ok(None);
        }
        Ok(self.cache.get(key).await.map(|stored| stored.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        if self.enabled {
            self.cache.insert(key.to_owned(), Stored { value, ttl }).await;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }

    async fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self
            .cache
            .iter()
            .map(|(key, stored)| StoreEntry {
                key: key.as_ref().clone(),
                value: stored.value,
                ttl: stored.ttl,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_absent_is_none() {
        let store = MemoryStore::default();
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(!store.remove("missing").await.unwrap());
    }

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::default();
        store.set("k", json!(1), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
        assert!(store.remove("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_value() {
        let store = MemoryStore::default();
        store.set("k", json!("old"), None).await.unwrap();
        store.set("k", json!("new"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::default();
        store
            .set("short", json!(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        store.set("long", json!(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn entries_lists_live_keys() {
        let store = MemoryStore::default();
        store.set("a", json!(1), None).await.unwrap();
        store
            .set("b", json!(2), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let mut entries = store.entries().await.unwrap();
        entries.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[1].ttl, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn disabled_store_drops_everything() {
        let store = MemoryStore::new(StoreConfig {
            enabled: false,
            ..StoreConfig::default()
        });
        assert!(!store.is_enabled());
        store.set("k", json!(1), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.entries().await.unwrap().is_empty());
    }

    #[test]
    fn store_config_from_json() {
        let config: StoreConfig = serde_json::from_str(r#"{ "enabled": false }"#).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_entries, 10_000);
    }
}
