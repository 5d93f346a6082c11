//! Event mechanics for post-commit ledger notifications.
//!
//! Domain crates define their event types (implementing [`Event`]); this crate
//! only knows how to wrap them in envelopes and move them through a bus.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryBusError, InMemoryEventBus};
