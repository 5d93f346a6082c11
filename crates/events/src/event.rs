use chrono::{DateTime, Utc};

use stockledger_core::TransactionId;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "inventory.transaction.completed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Transaction that triggered the event.
    fn transaction_id(&self) -> TransactionId;

    /// Ordering key; sequence numbers are assigned per key.
    fn partition_key(&self) -> String;
}
