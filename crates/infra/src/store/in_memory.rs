//! In-memory ledger store (tests/dev only).
//!
//! One `RwLock` over all tables serialises every atomic unit. Units run on a
//! copy of the rows they touch and are written back only once every step has
//! succeeded, so an injected fault mid-unit leaves the tables untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stockledger_core::{DomainError, TransactionId};
use stockledger_ledger::{Amendment, NewTransaction, ProductDescriptor, StockKey, StockRecord, Transaction};

use super::{LedgerStore, Reversal, StoreError, newest_first};
use crate::pool::{ConnectionManager, ConnectionPool, PoolError, PoolStats};

/// Failure injected into the next atomic units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Looks like a dropped connection; retryable.
    Transient,
    /// Looks like a constraint violation; not retryable.
    Permanent,
}

#[derive(Debug, Default)]
struct Tables {
    stock: BTreeMap<StockKey, StockRecord>,
    transactions: HashMap<TransactionId, Transaction>,
    descriptors: HashMap<String, ProductDescriptor>,
}

/// Pool handle for the in-memory store; carries no state of its own.
#[derive(Debug)]
pub struct MemoryConnection {
    pub serial: u64,
}

#[derive(Debug, Default)]
pub struct MemoryConnector {
    opened: AtomicU64,
}

#[async_trait]
impl ConnectionManager for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, PoolError> {
        Ok(MemoryConnection {
            serial: self.opened.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn is_valid(&self, _conn: &mut MemoryConnection) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    remaining: u32,
    fault: Option<Fault>,
    latency: Option<Duration>,
    unreachable: bool,
}

#[derive(Debug)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
    pool: ConnectionPool<MemoryConnector>,
    faults: Mutex<FaultPlan>,
    units_attempted: AtomicU64,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_pool(16, Duration::from_secs(2))
    }

    pub fn with_pool(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            pool: ConnectionPool::new(MemoryConnector::default(), capacity, acquire_timeout),
            faults: Mutex::new(FaultPlan::default()),
            units_attempted: AtomicU64::new(0),
        }
    }

    /// Fail the next `count` atomic units with `fault`, after their working copy was modified.
    pub fn fail_next(&self, count: u32, fault: Fault) {
        let mut plan = self.plan();
        plan.remaining = count;
        plan.fault = Some(fault);
    }

    /// Delay every call by `latency` while holding a pool handle.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.plan().latency = latency;
    }

    /// Make every call fail as if the store were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.plan().unreachable = unreachable;
    }

    /// Number of atomic units started (including failed and retried ones).
    pub fn units_attempted(&self) -> u64 {
        self.units_attempted.load(Ordering::Relaxed)
    }

    /// Overwrite a record directly (test setup).
    pub fn seed_stock(&self, record: StockRecord) {
        self.write().stock.insert(record.key(), record);
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a handle and apply configured latency / outage.
    async fn enter(&self) -> Result<crate::pool::PooledConnection<MemoryConnector>, StoreError> {
        let conn = self.pool.acquire().await?;
        let (latency, unreachable) = {
            let plan = self.plan();
            (plan.latency, plan.unreachable)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(StoreError::Transient("store unreachable".to_string()));
        }
        Ok(conn)
    }

    fn injected_fault(&self) -> Result<(), StoreError> {
        self.units_attempted.fetch_add(1, Ordering::Relaxed);
        let mut plan = self.plan();
        if plan.remaining == 0 {
            return Ok(());
        }
        plan.remaining -= 1;
        match plan.fault {
            Some(Fault::Transient) => Err(StoreError::Transient("injected: connection reset".to_string())),
            Some(Fault::Permanent) => Err(StoreError::Constraint("injected: constraint violated".to_string())),
            None => Ok(()),
        }
    }
}

fn stock_row(tables: &Tables, key: &StockKey, now: DateTime<Utc>) -> StockRecord {
    tables
        .stock
        .get(key)
        .cloned()
        .unwrap_or_else(|| StockRecord::empty(key, now))
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let _conn = self.enter().await?;
        Ok(())
    }

    async fn ensure_stock(&self, key: &StockKey, now: DateTime<Utc>) -> Result<StockRecord, StoreError> {
        let _conn = self.enter().await?;
        let mut tables = self.write();
        Ok(tables
            .stock
            .entry(key.clone())
            .or_insert_with(|| StockRecord::empty(key, now))
            .clone())
    }

    async fn list_stock(&self, product_id: &str) -> Result<Vec<StockRecord>, StoreError> {
        let _conn = self.enter().await?;
        Ok(self
            .read()
            .stock
            .values()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let _conn = self.enter().await?;
        Ok(self.read().transactions.get(&id).cloned())
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        let _conn = self.enter().await?;
        let mut txs: Vec<Transaction> = self.read().transactions.values().cloned().collect();
        newest_first(&mut txs);
        txs.truncate(limit);
        Ok(txs)
    }

    async fn apply_new(
        &self,
        id: TransactionId,
        draft: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        let _conn = self.enter().await?;
        let mut tables = self.write();

        if let Some(existing) = tables.transactions.get(&id) {
            return Ok(existing.clone());
        }

        let mut stock = stock_row(&tables, &draft.key, now);
        let mut tx = Transaction::begin(id, draft, &stock, now)?;
        stock.apply_delta(draft.delta(), now)?;
        tx.complete(now)?;
        self.injected_fault()?;

        tables.stock.insert(draft.key.clone(), stock);
        tables.transactions.insert(id, tx.clone());
        Ok(tx)
    }

    async fn apply_amendment(
        &self,
        id: TransactionId,
        amendment: &Amendment,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        let _conn = self.enter().await?;
        let mut tables = self.write();

        let mut tx = tables
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("transaction {id}")))?;
        let key = tx.key();
        let mut stock = stock_row(&tables, &key, now);

        let after = tx.amend(amendment, stock.quantity_on_hand, now)?;
        stock.quantity_on_hand = after;
        stock.updated_at = now;
        self.injected_fault()?;

        tables.stock.insert(key, stock);
        tables.transactions.insert(id, tx.clone());
        Ok(tx)
    }

    async fn apply_reversal(
        &self,
        id: TransactionId,
        reversal_id: TransactionId,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reversal, StoreError> {
        let _conn = self.enter().await?;
        let mut tables = self.write();

        let mut original = tables
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("transaction {id}")))?;

        if original.reversed_by == Some(reversal_id) {
            if let Some(compensating) = tables.transactions.get(&reversal_id) {
                return Ok(Reversal {
                    original,
                    compensating: compensating.clone(),
                });
            }
        }

        let draft = original.reversal(operator_id)?;
        let mut stock = stock_row(&tables, &draft.key, now);
        let mut compensating = Transaction::begin(reversal_id, &draft, &stock, now)?;
        stock.apply_delta(draft.delta(), now)?;
        compensating.complete(now)?;
        original.mark_reversed(reversal_id, &draft.operator_id, now)?;
        self.injected_fault()?;

        tables.stock.insert(draft.key.clone(), stock);
        tables.transactions.insert(reversal_id, compensating.clone());
        tables.transactions.insert(id, original.clone());
        Ok(Reversal { original, compensating })
    }

    async fn record_failed(&self, tx: &Transaction) -> Result<(), StoreError> {
        let _conn = self.enter().await?;
        self.write().transactions.entry(tx.id).or_insert_with(|| tx.clone());
        Ok(())
    }

    async fn get_descriptor(&self, product_id: &str) -> Result<Option<ProductDescriptor>, StoreError> {
        let _conn = self.enter().await?;
        Ok(self.read().descriptors.get(product_id).cloned())
    }

    async fn ensure_descriptor(&self, product_id: &str, now: DateTime<Utc>) -> Result<ProductDescriptor, StoreError> {
        let _conn = self.enter().await?;
        let mut tables = self.write();
        Ok(tables
            .descriptors
            .entry(product_id.to_string())
            .or_insert_with(|| ProductDescriptor::derive(product_id, now))
            .clone())
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
