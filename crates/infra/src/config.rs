//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults (every field has one)
//! 2. `config/stockledger.toml` (optional)
//! 3. environment variables `STOCKLEDGER__SECTION__FIELD`, e.g.
//!    `STOCKLEDGER__DATABASE__POOL_SIZE=40`

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
    /// Advisory per-operation latency budget.
    pub latency_budget_ms: u64,
    pub missing_transaction: MissingTransaction,
    /// Operation records kept for `getMetrics`.
    pub metrics_retention: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            events: EventsConfig::default(),
            latency_budget_ms: 500,
            missing_transaction: MissingTransaction::Strict,
            metrics_retention: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    /// Postgres URL. Required by the postgres backend.
    pub url: Option<String>,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    /// Upper bound on a single store call; exceeding it counts as transient.
    pub operation_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: None,
            pool_size: 20,
            acquire_timeout_ms: 2_000,
            operation_timeout_ms: 5_000,
            lock_timeout_ms: 2_000,
        }
    }
}

/// Where the ledger lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Postgres,
    /// In-process store for development and tests. Nothing survives a restart.
    Memory,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Distributed tier. Unset means local tier only.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub stock_ttl_secs: u64,
    pub descriptor_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "stockledger:".to_string(),
            stock_ttl_secs: 30,
            descriptor_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Redis pub/sub sink. Unset means no Redis sink.
    pub redis_url: Option<String>,
    pub channel: String,
    /// Also append events to the `inventory_events` table (needs a database url).
    pub table_sink: bool,
    /// Connections reserved for the table sink, separate from the ledger pool.
    pub table_sink_pool_size: usize,
    /// Commits leaving on-hand at or below this emit `inventory.stock.low`.
    pub low_stock_threshold: i64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            channel: "inventory.events".to_string(),
            table_sink: false,
            table_sink_pool_size: 2,
            low_stock_threshold: 10,
        }
    }
}

/// Behaviour of update/cancel for an id the ledger does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTransaction {
    /// Fail with NotFound.
    #[default]
    Strict,
    /// Return a synthetic transaction in the requested state; the ledger is not touched.
    Fabricate,
}

impl LedgerConfig {
    /// Load from `config/` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        Config::builder()
            .add_source(File::from(config_dir.join("stockledger")).required(false))
            .add_source(
                Environment::with_prefix("STOCKLEDGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = LedgerConfig::default();
        assert_eq!(cfg.database.backend, StoreBackend::Postgres);
        assert_eq!(cfg.database.url, None);
        assert_eq!(cfg.database.pool_size, 20);
        assert_eq!(cfg.events.table_sink_pool_size, 2);
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert_eq!(cfg.cache.stock_ttl_secs, 30);
        assert_eq!(cfg.cache.descriptor_ttl_secs, 3_600);
        assert_eq!(cfg.latency_budget(), Duration::from_millis(500));
        assert_eq!(cfg.missing_transaction, MissingTransaction::Strict);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("stockledger-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stockledger.toml"),
            r#"
            latency_budget_ms = 250
            missing_transaction = "fabricate"

            [retry]
            max_retries = 5
            strategy = "exponential"

            [cache]
            stock_ttl_secs = 60

            [database]
            backend = "memory"
            "#,
        )
        .unwrap();

        let cfg = LedgerConfig::load_from(&dir).unwrap();
        assert_eq!(cfg.latency_budget_ms, 250);
        assert_eq!(cfg.missing_transaction, MissingTransaction::Fabricate);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.cache.stock_ttl_secs, 60);
        assert_eq!(cfg.database.pool_size, 20);
        assert_eq!(cfg.database.backend, StoreBackend::Memory);

        std::fs::remove_dir_all(&dir).ok();
    }
}
