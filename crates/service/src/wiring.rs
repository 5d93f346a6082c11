//! Build an [`InventoryService`] from [`LedgerConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use stockledger_infra::config::{CacheConfig, EventsConfig};
use stockledger_infra::engine::EngineOptions;
use stockledger_infra::store::PgConnectionManager;
use stockledger_infra::{
    ConnectionPool, DistributedTier, EventPublisher, InMemoryLedgerStore, LedgerConfig, LedgerEngine,
    PostgresLedgerStore, StoreBackend, TieredCache,
};

#[cfg(feature = "redis")]
use stockledger_infra::cache::RedisTier;
#[cfg(feature = "redis")]
use stockledger_infra::event_bus::RedisPubSubEventBus;
use stockledger_infra::event_bus::PostgresEventSink;

use crate::service::{InventoryService, SharedStore};

impl InventoryService<SharedStore> {
    /// Wire store, caches and event sinks as configured.
    ///
    /// The postgres backend needs `database.url`. The in-memory store is only
    /// used when `database.backend = "memory"` is set explicitly. Installing a
    /// tracing subscriber is left to the binary.
    pub async fn from_config(config: &LedgerConfig) -> anyhow::Result<Self> {
        let db = &config.database;
        let store: SharedStore = match db.backend {
            StoreBackend::Postgres => {
                let url = db
                    .url
                    .as_deref()
                    .context("database.url is required by the postgres backend")?;
                let manager = PgConnectionManager::new(url).context("parsing database url")?;
                let pool = ConnectionPool::new(manager, db.pool_size, db.acquire_timeout());
                let store = PostgresLedgerStore::new(pool, db.lock_timeout());
                store.migrate().await.context("applying ledger schema")?;
                info!(pool_size = db.pool_size, "using postgres ledger store");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                warn!("using the in-memory ledger store; nothing survives a restart");
                Arc::new(InMemoryLedgerStore::with_pool(db.pool_size, db.acquire_timeout()))
            }
        };

        let (stock_cache, descriptor_cache) = caches(&config.cache)?;
        let publisher = publisher(&config.events, config.database.url.as_deref(), db.acquire_timeout())?;

        let engine = LedgerEngine::new(store)
            .with_retry_policy(config.retry.policy())
            .with_stock_cache(stock_cache)
            .with_descriptor_cache(descriptor_cache)
            .with_publisher(publisher)
            .with_options(EngineOptions {
                operation_timeout: db.operation_timeout(),
                low_stock_threshold: config.events.low_stock_threshold,
                missing_transaction: config.missing_transaction,
            });

        Ok(InventoryService::new(engine, config.latency_budget(), config.metrics_retention))
    }
}

type Caches<A, B> = (TieredCache<A>, TieredCache<B>);

fn caches(
    config: &CacheConfig,
) -> anyhow::Result<Caches<stockledger_ledger::StockRecord, stockledger_ledger::ProductDescriptor>> {
    let mut stock = TieredCache::new("stock", Duration::from_secs(config.stock_ttl_secs))
        .with_key_prefix(config.key_prefix.as_str());
    let mut descriptor = TieredCache::new("desc", Duration::from_secs(config.descriptor_ttl_secs))
        .with_key_prefix(config.key_prefix.as_str());

    if let Some(tier) = distributed_tier(config)? {
        stock = stock.with_distributed(tier.clone());
        descriptor = descriptor.with_distributed(tier);
    }
    Ok((stock, descriptor))
}

fn distributed_tier(config: &CacheConfig) -> anyhow::Result<Option<Arc<dyn DistributedTier>>> {
    let Some(url) = config.redis_url.as_deref() else {
        return Ok(None);
    };

    #[cfg(feature = "redis")]
    let tier: Option<Arc<dyn DistributedTier>> =
        Some(Arc::new(RedisTier::new(url).context("opening distributed cache tier")?));

    #[cfg(not(feature = "redis"))]
    let tier = {
        warn!(url, "cache.redis_url is set but the redis feature is disabled; local tier only");
        None
    };

    Ok(tier)
}

fn publisher(
    config: &EventsConfig,
    database_url: Option<&str>,
    acquire_timeout: Duration,
) -> anyhow::Result<EventPublisher> {
    if !config.enabled {
        return Ok(EventPublisher::disabled());
    }
    let mut publisher = EventPublisher::new();

    if let Some(url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            let bus = RedisPubSubEventBus::new(url, config.channel.as_str()).context("opening event channel")?;
            publisher = publisher.with_sink(Arc::new(bus));
        }
        #[cfg(not(feature = "redis"))]
        warn!(url, "events.redis_url is set but the redis feature is disabled; not publishing to redis");
    }

    if config.table_sink {
        match database_url {
            Some(url) => {
                // Own pool: event appends never take a slot from ledger units.
                let manager = PgConnectionManager::new(url).context("parsing database url for the event sink")?;
                let pool = ConnectionPool::new(manager, config.table_sink_pool_size, acquire_timeout);
                publisher = publisher.with_sink(Arc::new(PostgresEventSink::new(pool)));
            }
            None => warn!("events.table_sink needs database.url; table sink disabled"),
        }
    }

    if !publisher.is_enabled() {
        info!("no event sinks configured; events are dropped");
    }
    Ok(publisher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn postgres_backend_without_url_is_rejected() {
        let err = InventoryService::from_config(&LedgerConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("database.url"));
    }

    #[tokio::test]
    async fn memory_backend_must_be_chosen_explicitly() {
        let mut config = LedgerConfig::default();
        config.database.backend = StoreBackend::Memory;

        let service = InventoryService::from_config(&config).await.unwrap();
        let health = service.health_check().await;
        assert_eq!(health.data.status, crate::dto::HealthStatus::Healthy);
        assert_eq!(health.data.store.pool.capacity, 20);
        assert!(!health.data.events.enabled);
        assert_eq!(health.data.cache.distributed_healthy, None);
        // Subscriber installation belongs to the binary.
        assert!(!tracing::dispatcher::has_been_set());
    }

    #[test]
    fn table_sink_gets_its_own_pool() {
        let config = EventsConfig {
            table_sink: true,
            ..EventsConfig::default()
        };
        let publisher = publisher(&config, Some("postgres://ledger@localhost/ledger"), Duration::from_millis(50)).unwrap();
        assert!(publisher.is_enabled());
        assert_eq!(publisher.stats().sinks, 1);
    }
}
