//! Bounded connection pool.
//!
//! A fixed number of permits caps how many handles exist at once. Callers wait
//! for a permit up to `acquire_timeout` and then fail with
//! [`PoolError::Exhausted`]; nothing ever waits unbounded. Idle handles are
//! reused after a validity check (pre-ping); handles failing it are dropped and
//! replaced with fresh ones.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Creates and checks the handles a pool hands out.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Pre-ping run on idle handles before reuse.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection pool exhausted: no handle available within {0:?}")]
    Exhausted(Duration),

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("connection pool closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    idle: Mutex<Vec<M::Connection>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn take_idle(&self) -> Option<M::Connection> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn put_idle(&self, conn: M::Connection) {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(conn);
    }
}

/// Fixed-capacity pool of reusable store handles.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ConnectionManager> core::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("acquire_timeout", &self.inner.acquire_timeout)
            .finish()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                acquire_timeout,
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Check out a handle, waiting at most `acquire_timeout` for one to free up.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let timeout = self.inner.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                warn!(capacity = self.inner.capacity, ?timeout, "connection pool exhausted");
                return Err(PoolError::Exhausted(timeout));
            }
        };

        while let Some(mut conn) = self.inner.take_idle() {
            if self.inner.manager.is_valid(&mut conn).await {
                return Ok(PooledConnection::new(conn, self.inner.clone(), permit));
            }
            debug!("discarding stale pooled connection");
        }

        let conn = self.inner.manager.connect().await?;
        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    /// Return a handle to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Stop handing out handles; pending and future `acquire` calls fail `Closed`.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.inner.permits.available_permits();
        PoolStats {
            capacity: self.inner.capacity,
            in_use: self.inner.capacity.saturating_sub(available),
            idle: self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

/// A checked-out handle. Returned to the pool on drop unless detached.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> core::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("attached", &self.conn.is_some())
            .finish()
    }
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(conn: M::Connection, pool: Arc<PoolInner<M>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    /// Take the handle out of the pool for good (e.g. after a broken pipe).
    /// The capacity slot is freed; a fresh handle is opened on next demand.
    pub fn detach(mut self) -> M::Connection {
        // `conn` is only ever `None` after `detach`/`drop`, which consume `self`.
        self.conn.take().expect("pooled connection present until detached")
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection present until detached")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection present until detached")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.pool.permits.is_closed() {
                self.pool.put_idle(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingManager {
        opened: AtomicUsize,
        reject_idle: AtomicBool,
    }

    #[async_trait]
    impl ConnectionManager for Arc<CountingManager> {
        type Connection = usize;

        async fn connect(&self) -> Result<usize, PoolError> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn is_valid(&self, _conn: &mut usize) -> bool {
            !self.reject_idle.load(Ordering::SeqCst)
        }
    }

    fn pool(capacity: usize) -> (ConnectionPool<Arc<CountingManager>>, Arc<CountingManager>) {
        let manager = Arc::new(CountingManager::default());
        let pool = ConnectionPool::new(manager.clone(), capacity, Duration::from_millis(50));
        (pool, manager)
    }

    #[tokio::test]
    async fn exhausted_after_wait_budget() {
        let (pool, _) = pool(2);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, PoolError::Exhausted(Duration::from_millis(50)));
        assert_eq!(pool.stats().in_use, 2);
    }

    #[tokio::test]
    async fn released_handles_are_reused() {
        let (pool, manager) = pool(1);
        let first = pool.acquire().await.unwrap();
        assert_eq!(*first, 0);
        pool.release(first);

        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 0);
        assert_eq!(manager.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_gets_handle_released_within_budget() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn stale_idle_handles_are_replaced() {
        let (pool, manager) = pool(1);
        drop(pool.acquire().await.unwrap());
        manager.reject_idle.store(true, Ordering::SeqCst);

        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 1);
    }

    #[tokio::test]
    async fn detached_handles_free_their_slot() {
        let (pool, _) = pool(1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.detach(), 0);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let (pool, _) = pool(1);
        pool.close();
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }
}
