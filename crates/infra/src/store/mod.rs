//! Persistent ledger store.
//!
//! The store owns the authoritative stock records and transactions. Each
//! mutating method is one atomic unit: it either commits completely or leaves
//! nothing behind. Same-key units are serialised by the store itself (row locks
//! in Postgres, a table lock in memory), never by an in-process engine lock.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use chrono::{DateTime, Utc};
use thiserror::Error;

use stockledger_core::{DomainError, TransactionId};
use stockledger_ledger::{Amendment, NewTransaction, ProductDescriptor, StockKey, StockRecord, Transaction};

use crate::pool::{PoolError, PoolStats};
use crate::retry::Transient;

pub use in_memory::{Fault, InMemoryLedgerStore};
pub use postgres::{PgConnectionManager, PostgresLedgerStore};

/// Store operation error.
///
/// - **Domain**: a business rule rejected the unit (detected under lock)
/// - **Transient**: connection loss, timeouts, lock/serialisation conflicts
/// - **Constraint**: the store refused the write (integrity violation)
/// - **Pool**: no handle could be checked out
/// - **Backend**: any other permanent store failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("store failure: {0}")]
    Backend(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Pool(PoolError::Connect(_)) => true,
            _ => false,
        }
    }
}

/// Result of a committed cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reversal {
    /// The original transaction, now REVERSED.
    pub original: Transaction,
    /// The compensating transaction, COMPLETED.
    pub compensating: Transaction,
}

/// Authoritative ledger storage.
///
/// Callers pre-generate transaction ids so that a unit retried after an
/// ambiguous failure (e.g. a timeout racing the commit) is applied once:
/// `apply_new` and `apply_reversal` return the already-committed result when
/// they see their id again.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Current record for `key`, created with zero quantities if absent.
    async fn ensure_stock(&self, key: &StockKey, now: DateTime<Utc>) -> Result<StockRecord, StoreError>;

    /// Every known record for `product_id`.
    async fn list_stock(&self, product_id: &str) -> Result<Vec<StockRecord>, StoreError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Most recent transactions, newest first.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError>;

    /// Insert PROCESSING, move stock, mark COMPLETED; all or nothing.
    async fn apply_new(
        &self,
        id: TransactionId,
        draft: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError>;

    /// Revert the transaction's delta and apply the amended one; all or nothing.
    async fn apply_amendment(
        &self,
        id: TransactionId,
        amendment: &Amendment,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError>;

    /// Commit the compensating transaction and mark the original REVERSED; all or nothing.
    async fn apply_reversal(
        &self,
        id: TransactionId,
        reversal_id: TransactionId,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reversal, StoreError>;

    /// Persist a FAILED audit record. Never touches stock.
    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError>;

    async fn get_descriptor(&self, product_id: &str) -> Result<Option<ProductDescriptor>, StoreError>;

    /// Descriptor for `product_id`, derived and stored on first lookup.
    async fn ensure_descriptor(&self, product_id: &str, now: DateTime<Utc>) -> Result<ProductDescriptor, StoreError>;

    fn pool_stats(&self) -> PoolStats;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn ensure_stock(&self, key: &StockKey, now: DateTime<Utc>) -> Result<StockRecord, StoreError> {
        (**self).ensure_stock(key, now).await
    }

    async fn list_stock(&self, product_id: &str) -> Result<Vec<StockRecord>, StoreError> {
        (**self).list_stock(product_id).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        (**self).get_transaction(id).await
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        (**self).recent_transactions(limit).await
    }

    async fn apply_new(
        &self,
        id: TransactionId,
        draft: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        (**self).apply_new(id, draft, now).await
    }

    async fn apply_amendment(
        &self,
        id: TransactionId,
        amendment: &Amendment,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        (**self).apply_amendment(id, amendment, now).await
    }

    async fn apply_reversal(
        &self,
        id: TransactionId,
        reversal_id: TransactionId,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reversal, StoreError> {
        (**self).apply_reversal(id, reversal_id, operator_id, now).await
    }

    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError> {
        (**self).record_failed(tx).await
    }

    async fn get_descriptor(&self, product_id: &str) -> Result<Option<ProductDescriptor>, StoreError> {
        (**self).get_descriptor(product_id).await
    }

    async fn ensure_descriptor(&self, product_id: &str, now: DateTime<Utc>) -> Result<ProductDescriptor, StoreError> {
        (**self).ensure_descriptor(product_id, now).await
    }

    fn pool_stats(&self) -> PoolStats {
        (**self).pool_stats()
    }
}

/// Sort newest first; ties broken by id so the order is total.
pub(crate) fn newest_first(txs: &mut [Transaction]) {
    txs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}
