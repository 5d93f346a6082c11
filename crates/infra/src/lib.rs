//! Infrastructure layer: store adapters, connection pool, retry, caching,
//! event publishing, configuration and the transaction engine.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod pool;
pub mod publisher;
pub mod retry;
pub mod store;

pub use cache::{CacheError, CacheSource, CacheStats, DistributedTier, InMemoryTtlStore, TieredCache};
pub use config::{LedgerConfig, MissingTransaction, StoreBackend};
pub use engine::{EngineHealth, EngineOptions, LedgerEngine};
pub use error::{LedgerError, LedgerResult};
pub use pool::{ConnectionManager, ConnectionPool, PoolError, PoolStats, PooledConnection};
pub use publisher::{EventPublisher, EventSink, PublisherStats};
pub use retry::{BackoffStrategy, RetryError, RetryExecutor, RetryPolicy, Transient};
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, Reversal, StoreError};
