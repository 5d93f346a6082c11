//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes ledger events to whoever listens (audit sinks, other
//! services, tests). It is deliberately lightweight:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, an events table.
//! - **At-most-once, best-effort**: the ledger commit is final before anything is
//!   published; a failed publish is logged by the caller and dropped.
//! - **No ordering guarantees** across keys; envelopes carry per-key sequence
//!   numbers for consumers that need to reconstruct order.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let subscription = bus.subscribe();
/// match subscription.recv_timeout(Duration::from_secs(1)) {
///     Ok(envelope) => handle(envelope),
///     Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
///     Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Event bus (pub/sub abstraction).
///
/// `publish()` may block on IO; callers on an async runtime should run it on a
/// blocking thread. Implementations must be safe to share across threads.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
