//! Event sink appending envelopes to the `inventory_events` table.
//!
//! Write-only: subscriptions on this sink never receive anything; consumers
//! read the table directly.

use std::sync::mpsc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::runtime::Handle;

use stockledger_events::{EventBus, EventEnvelope, Subscription};

use crate::pool::ConnectionPool;
use crate::store::{PgConnectionManager, StoreError};
use crate::store::postgres::map_sqlx_error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink needs a tokio runtime to run on")]
    NoRuntime,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PostgresEventSink {
    pool: ConnectionPool<PgConnectionManager>,
}

impl PostgresEventSink {
    pub fn new(pool: ConnectionPool<PgConnectionManager>) -> Self {
        Self { pool }
    }

    pub async fn append(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO inventory_events (
                event_id, transaction_id, kind, partition_key, sequence_number, payload, emitted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id().as_uuid())
        .bind(envelope.transaction_id().as_uuid())
        .bind(envelope.event_type())
        .bind(envelope.partition_key())
        .bind(i64::try_from(envelope.sequence_number()).unwrap_or(i64::MAX))
        .bind(envelope.payload())
        .bind(envelope.emitted_at())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("append_event", e))?;
        Ok(())
    }
}

impl EventBus<EventEnvelope<JsonValue>> for PostgresEventSink {
    type Error = SinkError;

    /// Blocks on the current runtime; call from a blocking thread.
    fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let handle = Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        handle.block_on(self.append(&message))?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        let (_tx, rx) = mpsc::channel();
        Subscription::new(rx)
    }
}
