//! Best-effort, post-commit event publishing.
//!
//! The ledger commit is final before `publish` is called. Delivery runs on the
//! blocking pool so a slow sink never delays the caller; failures are logged,
//! counted and dropped (at-most-once).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use stockledger_core::EventId;
use stockledger_events::{Event, EventBus, EventEnvelope};

/// Object-safe view of an [`EventBus`] carrying JSON envelopes.
pub trait EventSink: Send + Sync {
    fn deliver(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String>;
}

impl<B> EventSink for B
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn deliver(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String> {
        self.publish(envelope).map_err(|e| format!("{e:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub enabled: bool,
    pub sinks: usize,
    pub published: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
}

pub struct EventPublisher {
    sinks: Vec<Arc<dyn EventSink>>,
    enabled: bool,
    sequences: Mutex<HashMap<String, u64>>,
    counters: Arc<Counters>,
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("enabled", &self.enabled)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::disabled()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            enabled: true,
            sequences: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// A publisher that drops everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.sinks.is_empty()
    }

    /// Wrap `event` in an envelope and hand it to every sink in the background.
    ///
    /// Returns the envelope that was sent, or `None` when publishing is off or the
    /// event could not be serialized.
    pub fn publish<E>(&self, event: &E) -> Option<EventEnvelope<JsonValue>>
    where
        E: Event + Serialize,
    {
        if !self.is_enabled() {
            return None;
        }

        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "dropping unserializable event");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let partition_key = event.partition_key();
        let sequence_number = self.next_sequence(&partition_key);
        let envelope = EventEnvelope::new(
            EventId::new(),
            event.transaction_id(),
            event.event_type(),
            partition_key,
            sequence_number,
            Utc::now(),
            payload,
        );

        let sinks = self.sinks.clone();
        let counters = self.counters.clone();
        let outgoing = envelope.clone();
        let deliver = move || deliver_all(&sinks, &counters, outgoing);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // Fire and forget.
                drop(handle.spawn_blocking(deliver));
            }
            Err(_) => deliver(),
        }

        Some(envelope)
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            enabled: self.is_enabled(),
            sinks: self.sinks.len(),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn next_sequence(&self, partition_key: &str) -> u64 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(partition_key.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }
}

fn deliver_all(sinks: &[Arc<dyn EventSink>], counters: &Counters, envelope: EventEnvelope<JsonValue>) {
    for sink in sinks {
        match sink.deliver(envelope.clone()) {
            Ok(()) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_type = envelope.event_type(),
                    sequence = envelope.sequence_number(),
                    "event published"
                );
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = envelope.event_type(),
                    transaction_id = %envelope.transaction_id(),
                    error = %e,
                    "event publish failed; dropping"
                );
            }
        }
    }
}
