use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{EventId, TransactionId};

/// Envelope for an emitted event.
///
/// Notes:
/// - `sequence_number` increases monotonically per `partition_key` within one
///   publisher; consumers may use it to reorder, delivery order is not guaranteed.
/// - `payload` is the serialized domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    transaction_id: TransactionId,
    event_type: String,
    partition_key: String,

    /// Position of this event among the events of its partition key.
    sequence_number: u64,

    emitted_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        transaction_id: TransactionId,
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        sequence_number: u64,
        emitted_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            transaction_id,
            event_type: event_type.into(),
            partition_key: partition_key.into(),
            sequence_number,
            emitted_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
