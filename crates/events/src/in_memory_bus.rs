//! In-process event bus for tests/dev.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

/// Per-subscriber buffer used by [`InMemoryEventBus::new`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("no live subscriber accepted the message")]
    Undelivered,
}

/// Broadcast bus with a bounded buffer per subscriber.
///
/// Delivery is at-most-once: a subscriber whose buffer is full misses the
/// message (counted in [`dropped`](Self::dropped)); a subscriber that went away
/// is pruned. Publishing with nobody listening is not an error.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<SyncSender<M>>>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Copies handed to a subscriber.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Copies lost to a full subscriber buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    /// Fails only when subscribers exist and none of them took the message.
    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subs.is_empty() {
            return Ok(());
        }

        let mut accepted = 0_u64;
        subs.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                accepted += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.delivered.fetch_add(accepted, Ordering::Relaxed);

        if accepted == 0 && !subs.is_empty() {
            return Err(InMemoryBusError::Undelivered);
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        Subscription::new(rx)
    }
}
