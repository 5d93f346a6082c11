//! Tiered read-through cache.
//!
//! Read path: local map → distributed TTL tier → loader (the ledger store).
//! A loaded value is written through to both tiers. Mutations *delete* the
//! key from both tiers; the next read repopulates it.
//!
//! The distributed tier is optional. When it is missing or failing, reads fall
//! through to the loader; failures are logged and counted, never returned.

pub mod distributed;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis_tier;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

pub use distributed::{DistributedTier, InMemoryTtlStore};
pub use local::LocalTier;
#[cfg(feature = "redis")]
pub use redis_tier::RedisTier;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("distributed cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(String),
}

/// Counters surfaced by health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    pub ttl_secs: u64,
    pub distributed_configured: bool,
    pub local_entries: usize,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub invalidations: u64,
    pub distributed_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    invalidations: AtomicU64,
    distributed_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Distributed,
    Loader,
}

/// One cache instance: a namespace, a TTL and a value type.
pub struct TieredCache<V> {
    namespace: String,
    key_prefix: String,
    ttl: Duration,
    local: LocalTier<V>,
    distributed: Option<Arc<dyn DistributedTier>>,
    counters: Counters,
    // Bumped on every invalidation; a load that raced one is not written back.
    epoch: AtomicU64,
}

impl<V> core::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TieredCache")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .field("distributed", &self.distributed.is_some())
            .finish()
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            key_prefix: String::new(),
            ttl,
            local: LocalTier::default(),
            distributed: None,
            counters: Counters::default(),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn with_distributed(mut self, tier: Arc<dyn DistributedTier>) -> Self {
        self.distributed = Some(tier);
        self
    }

    /// Prefix prepended to keys in the distributed tier (shared between services).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `{namespace}:{part}:{part}...`
    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.namespace.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Read through the tiers, calling `load` only when both miss.
    pub async fn get_or_load<E, F, Fut>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_load_traced(key, load).await.map(|(v, _)| v)
    }

    /// Like [`get_or_load`](Self::get_or_load), also reporting which tier answered.
    pub async fn get_or_load_traced<E, F, Fut>(&self, key: &str, load: F) -> Result<(V, CacheSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.local.get(key) {
            bump(&self.counters.local_hits);
            debug!(key, "cache hit (local)");
            return Ok((v, CacheSource::Local));
        }

        let epoch = self.epoch.load(Ordering::Acquire);

        if let Some(v) = self.read_distributed(key).await {
            bump(&self.counters.distributed_hits);
            debug!(key, "cache hit (distributed)");
            self.local.insert_if(key, v.clone(), self.ttl, || self.is_current(epoch));
            return Ok((v, CacheSource::Distributed));
        }

        bump(&self.counters.misses);
        debug!(key, "cache miss");
        let v = load().await?;
        bump(&self.counters.loads);

        if self.is_current(epoch) {
            self.write_distributed(key, &v).await;
            // An invalidation may have landed during the write-through.
            if !self.local.insert_if(key, v.clone(), self.ttl, || self.is_current(epoch)) {
                debug!(key, "fill raced an invalidation; discarding");
                self.delete_distributed(key).await;
            }
        }
        Ok((v, CacheSource::Loader))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Delete `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.local.remove(key);
        bump(&self.counters.invalidations);
        self.delete_distributed(key).await;
    }

    async fn delete_distributed(&self, key: &str) {
        let Some(tier) = &self.distributed else { return };
        if let Err(e) = tier.delete(&self.remote_key(key)).await {
            bump(&self.counters.distributed_errors);
            warn!(key, error = %e, "failed to delete distributed cache entry");
        }
    }

    /// Probe the distributed tier. `None` when none is configured.
    pub async fn distributed_healthy(&self) -> Option<bool> {
        let tier = self.distributed.as_ref()?;
        Some(tier.ping().await.is_ok())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            namespace: self.namespace.clone(),
            ttl_secs: self.ttl.as_secs(),
            distributed_configured: self.distributed.is_some(),
            local_entries: self.local.len(),
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            distributed_hits: self.counters.distributed_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            distributed_errors: self.counters.distributed_errors.load(Ordering::Relaxed),
        }
    }

    async fn read_distributed(&self, key: &str) -> Option<V> {
        let tier = self.distributed.as_ref()?;
        let remote = self.remote_key(key);
        let raw = match tier.get(&remote).await {
            Ok(raw) => raw?,
            Err(e) => {
                bump(&self.counters.distributed_errors);
                warn!(key, error = %e, "distributed cache read failed; falling through");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "corrupt distributed cache entry; discarding");
                if tier.delete(&remote).await.is_err() {
                    bump(&self.counters.distributed_errors);
                }
                None
            }
        }
    }

    async fn write_distributed(&self, key: &str, value: &V) {
        let Some(tier) = &self.distributed else { return };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %CacheError::Serialization(e.to_string()), "skipping distributed write");
                return;
            }
        };
        if let Err(e) = tier.set_ex(&self.remote_key(key), &raw, self.ttl).await {
            bump(&self.counters.distributed_errors);
            warn!(key, error = %e, "distributed cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicU32;

    fn cache_with(tier: Arc<InMemoryTtlStore>) -> TieredCache<i64> {
        TieredCache::new("stock", Duration::from_secs(30))
            .with_distributed(tier)
            .with_key_prefix("sl:")
    }

    async fn load(calls: &AtomicU32, v: i64) -> Result<i64, Infallible> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    }

    #[test]
    fn key_shapes() {
        let cache: TieredCache<i64> = TieredCache::new("stock", Duration::from_secs(30));
        assert_eq!(cache.key(&["widget", "A1"]), "stock:widget:A1");
        let desc: TieredCache<i64> = TieredCache::new("desc", Duration::from_secs(3600));
        assert_eq!(desc.key(&["widget"]), "desc:widget");
    }

    #[tokio::test]
    async fn reads_fill_both_tiers() {
        let tier = Arc::new(InMemoryTtlStore::new());
        let cache = cache_with(tier.clone());
        let calls = AtomicU32::new(0);

        let (v, src) = cache.get_or_load_traced("stock:w:A1", || load(&calls, 5)).await.unwrap();
        assert_eq!((v, src), (5, CacheSource::Loader));
        assert_eq!(tier.get("sl:stock:w:A1").await.unwrap().as_deref(), Some("5"));

        let (_, src) = cache.get_or_load_traced("stock:w:A1", || load(&calls, 6)).await.unwrap();
        assert_eq!(src, CacheSource::Local);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distributed_hit_fills_local() {
        let tier = Arc::new(InMemoryTtlStore::new());
        tier.put_raw("sl:stock:w:A1", "9", Duration::from_secs(30));
        let cache = cache_with(tier);
        let calls = AtomicU32::new(0);

        let (v, src) = cache.get_or_load_traced("stock:w:A1", || load(&calls, 1)).await.unwrap();
        assert_eq!((v, src), (9, CacheSource::Distributed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().local_entries, 1);
    }

    #[tokio::test]
    async fn invalidate_deletes_everywhere() {
        let tier = Arc::new(InMemoryTtlStore::new());
        let cache = cache_with(tier.clone());
        let calls = AtomicU32::new(0);

        cache.get_or_load("stock:w:A1", || load(&calls, 5)).await.unwrap();
        cache.invalidate("stock:w:A1").await;
        assert!(tier.is_empty());

        let v = cache.get_or_load("stock:w:A1", || load(&calls, 7)).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn outage_degrades_to_loader() {
        let tier = Arc::new(InMemoryTtlStore::new());
        tier.set_unavailable(true);
        let cache = cache_with(tier);
        let calls = AtomicU32::new(0);

        let v = cache.get_or_load("stock:w:A1", || load(&calls, 3)).await.unwrap();
        assert_eq!(v, 3);
        assert!(cache.stats().distributed_errors >= 2);
        assert_eq!(cache.distributed_healthy().await, Some(false));
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let tier = Arc::new(InMemoryTtlStore::new());
        tier.put_raw("sl:stock:w:A1", "{not json", Duration::from_secs(30));
        let cache = cache_with(tier.clone());
        let calls = AtomicU32::new(0);

        let (v, src) = cache.get_or_load_traced("stock:w:A1", || load(&calls, 4)).await.unwrap();
        assert_eq!((v, src), (4, CacheSource::Loader));
        assert_eq!(tier.get("sl:stock:w:A1").await.unwrap().as_deref(), Some("4"));
    }

    /// Shared tier whose writes take a while to land.
    #[derive(Debug)]
    struct SlowWrites {
        inner: InMemoryTtlStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DistributedTier for SlowWrites {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }

        async fn ping(&self) -> Result<(), CacheError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn invalidation_during_write_through_wins() {
        let tier = Arc::new(SlowWrites {
            inner: InMemoryTtlStore::new(),
            delay: Duration::from_millis(100),
        });
        let cache: TieredCache<i64> = TieredCache::new("stock", Duration::from_secs(30))
            .with_distributed(tier.clone())
            .with_key_prefix("sl:");
        let calls = AtomicU32::new(0);

        // The reader loads the pre-commit value; the commit invalidates mid write-through.
        let (first, ()) = tokio::join!(cache.get_or_load("stock:w:A1", || load(&calls, 50)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cache.invalidate("stock:w:A1").await;
        });
        assert_eq!(first.unwrap(), 50);
        assert!(tier.inner.is_empty());
        assert_eq!(cache.stats().local_entries, 0);

        let (v, src) = cache.get_or_load_traced("stock:w:A1", || load(&calls, 0)).await.unwrap();
        assert_eq!((v, src), (0, CacheSource::Loader));
    }

    #[tokio::test]
    async fn load_errors_are_not_cached() {
        let cache: TieredCache<i64> = TieredCache::new("stock", Duration::from_secs(30));
        let err: Result<i64, &str> = cache.get_or_load("k", || async { Err("down") }).await;
        assert_eq!(err, Err("down"));
        assert_eq!(cache.stats().local_entries, 0);
    }
}
