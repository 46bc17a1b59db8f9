//! Cache-aside lookups for tokens and groups.
//!
//! The shared cache is fail-open: any cache error, timeout or undecodable
//! payload falls through to the authoritative store. Store errors propagate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::cache::{CacheError, CacheStore};
use super::config::EntityCacheConfig;
use super::store::{Store, StoreError};
use super::store_types::{Group, Token};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn token_cache_key(key: &str) -> String {
    format!("token:{key}")
}

pub fn group_cache_key(id: &str) -> String {
    format!("group:{id}")
}

#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn Store>,
    cache: Option<Arc<dyn CacheStore>>,
    ttl: Duration,
    cache_timeout: Duration,
    store_timeout: Duration,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("cache_enabled", &self.cache.is_some())
            .field("ttl", &self.ttl)
            .field("cache_timeout", &self.cache_timeout)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl EntityCache {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Option<Arc<dyn CacheStore>>,
        config: &EntityCacheConfig,
    ) -> Self {
        Self {
            store,
            cache,
            ttl: config.ttl(),
            cache_timeout: config.timeout(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn get_token(&self, key: &str) -> Result<Token, StoreError> {
        let cache_key = token_cache_key(key);
        if let Some(mut token) = self.read_cached::<Token>(&cache_key).await {
            // The secret never leaves the process in serialized form.
            token.key = key.to_string();
            return Ok(token);
        }
        let token = self
            .with_store_deadline(self.store.get_token_by_key(key))
            .await?;
        self.write_back(&cache_key, &token).await;
        Ok(token)
    }

    pub async fn get_group(&self, id: &str) -> Result<Group, StoreError> {
        let cache_key = group_cache_key(id);
        if let Some(group) = self.read_cached::<Group>(&cache_key).await {
            return Ok(group);
        }
        let group = self.with_store_deadline(self.store.get_group(id)).await?;
        self.write_back(&cache_key, &group).await;
        Ok(group)
    }

    pub async fn invalidate_token(&self, key: &str) {
        self.delete_cached(&token_cache_key(key)).await;
    }

    pub async fn invalidate_group(&self, id: &str) {
        self.delete_cached(&group_cache_key(id)).await;
    }

    /// Writes an already-updated token over its cached copy.
    pub async fn refresh_token(&self, token: &Token) {
        self.write_back(&token_cache_key(&token.key), token).await;
    }

    pub async fn refresh_group(&self, group: &Group) {
        self.write_back(&group_cache_key(&group.id), group).await;
    }

    async fn read_cached<T: DeserializeOwned>(&self, cache_key: &str) -> Option<T> {
        let cache = self.cache.as_ref()?;
        let raw = match self.with_cache_deadline(cache.get(cache_key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key = %redact_key(cache_key), error = %err, "entity cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key = %redact_key(cache_key), error = %err, "undecodable entity cache payload");
                None
            }
        }
    }

    async fn write_back<T: Serialize>(&self, cache_key: &str, value: &T) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key = %redact_key(cache_key), error = %err, "failed to encode entity for cache");
                return;
            }
        };
        if let Err(err) = self
            .with_cache_deadline(cache.set(cache_key, &raw, self.ttl))
            .await
        {
            tracing::warn!(key = %redact_key(cache_key), error = %err, "entity cache write-back failed");
        }
    }

    async fn delete_cached(&self, cache_key: &str) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(err) = self.with_cache_deadline(cache.delete(cache_key)).await {
            tracing::warn!(key = %redact_key(cache_key), error = %err, "entity cache invalidation failed");
        }
    }

    async fn with_cache_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.cache_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(self.cache_timeout))?
    }

    async fn with_store_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

/// Token cache keys embed the secret; keep only the scope in logs.
fn redact_key(cache_key: &str) -> &str {
    match cache_key.split_once(':') {
        Some(("token", _)) => "token:<redacted>",
        _ => cache_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::cache::MemoryCacheStore;
    use crate::gateway::store::MemoryStore;
    use crate::gateway::store_types::TokenStatus;
    use async_trait::async_trait;

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
    }

    async fn seeded_store() -> (Arc<MemoryStore>, Token) {
        let store = Arc::new(MemoryStore::new());
        store.create_group(&Group::new("g1")).await.expect("group");
        let token = store
            .create_token(Token::new("g1", "sk-secret").with_name("t1"))
            .await
            .expect("token");
        (store, token)
    }

    #[tokio::test]
    async fn token_lookup_is_cached_until_invalidated() {
        let (store, token) = seeded_store().await;
        let cache = Arc::new(MemoryCacheStore::new());
        let entities = EntityCache::new(
            store.clone(),
            Some(cache.clone()),
            &EntityCacheConfig::default(),
        );

        let first = entities.get_token("sk-secret").await.expect("first");
        assert_eq!(first, token);

        let raw = cache
            .get(&token_cache_key("sk-secret"))
            .await
            .expect("cache get")
            .expect("written back");
        assert!(!raw.contains("sk-secret"));

        store
            .update_token_status(token.id, TokenStatus::Disabled, None)
            .await
            .expect("status");
        let cached = entities.get_token("sk-secret").await.expect("cached");
        assert_eq!(cached.status, TokenStatus::Enabled);
        assert_eq!(cached.key, "sk-secret");

        entities.invalidate_token("sk-secret").await;
        let fresh = entities.get_token("sk-secret").await.expect("fresh");
        assert_eq!(fresh.status, TokenStatus::Disabled);
    }

    #[tokio::test]
    async fn broken_cache_falls_back_to_store() {
        let (store, token) = seeded_store().await;
        let entities = EntityCache::new(
            store,
            Some(Arc::new(BrokenCache)),
            &EntityCacheConfig::default(),
        );
        assert_eq!(entities.get_token("sk-secret").await.expect("token"), token);
        assert_eq!(entities.get_group("g1").await.expect("group").id, "g1");
        entities.invalidate_group("g1").await;
    }

    #[tokio::test]
    async fn undecodable_payload_is_treated_as_miss() {
        let (store, _) = seeded_store().await;
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .set(&group_cache_key("g1"), "not json", Duration::from_secs(60))
            .await
            .expect("seed");
        let entities = EntityCache::new(store, Some(cache.clone()), &EntityCacheConfig::default());

        let group = entities.get_group("g1").await.expect("group");
        assert_eq!(group.id, "g1");
        let raw = cache
            .get(&group_cache_key("g1"))
            .await
            .expect("get")
            .expect("rewritten");
        assert_ne!(raw, "not json");
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let (store, _) = seeded_store().await;
        let entities = EntityCache::new(store, None, &EntityCacheConfig::default());
        assert!(entities.get_token("nope").await.expect_err("missing").is_not_found());
        assert!(entities.get_group("nope").await.expect_err("missing").is_not_found());
    }

    #[tokio::test]
    async fn refresh_overwrites_cached_token() {
        let (store, mut token) = seeded_store().await;
        let cache = Arc::new(MemoryCacheStore::new());
        let entities = EntityCache::new(store, Some(cache), &EntityCacheConfig::default());
        entities.get_token("sk-secret").await.expect("warm");

        token.used_amount = 42.0;
        token.status = TokenStatus::Exhausted;
        entities.refresh_token(&token).await;

        let cached = entities.get_token("sk-secret").await.expect("cached");
        assert_eq!(cached.used_amount, 42.0);
        assert_eq!(cached.status, TokenStatus::Exhausted);
    }
}
