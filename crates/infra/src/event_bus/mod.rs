//! Infrastructure-backed event sinks.
//!
//! The bus abstraction lives in `stockledger-events`; these are transports for
//! ledger event envelopes. All of them are best-effort: the publisher logs and
//! drops whatever they fail to deliver.

pub mod postgres_table;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use postgres_table::{PostgresEventSink, SinkError};
#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
