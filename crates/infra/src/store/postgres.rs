//! Postgres-backed ledger store.
//!
//! Every atomic unit runs in one SQL transaction on one pooled connection. The
//! stock row (and, for update/cancel, the transaction row) is locked with
//! `SELECT ... FOR UPDATE`, so same-key units are linearised by Postgres across
//! any number of engine instances. `SET LOCAL lock_timeout` bounds how long a
//! unit waits behind another one.
//!
//! ## Error Mapping
//!
//! | sqlx error | SQLSTATE | StoreError |
//! |---|---|---|
//! | Database | `40001` serialization failure | `Transient` |
//! | Database | `40P01` deadlock detected | `Transient` |
//! | Database | `55P03` lock not available (lock_timeout) | `Transient` |
//! | Database | `57014` query canceled (statement_timeout) | `Transient` |
//! | Database | `08xxx` connection exception | `Transient` |
//! | Database | `23xxx` integrity constraint violation | `Constraint` |
//! | Database | any other | `Backend` |
//! | Io / PoolTimedOut | N/A | `Transient` |
//! | other | N/A | `Backend` |
//!
//! Lock order is always transaction row, then stock row.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Connection, PgConnection, Row};
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{DomainError, TransactionId};
use stockledger_ledger::{
    Amendment, NewTransaction, OperationKind, ProductDescriptor, StockKey, StockRecord, Transaction,
    TransactionState,
};

use super::{LedgerStore, Reversal, StoreError};
use crate::pool::{ConnectionManager, ConnectionPool, PoolError, PoolStats};

const MIGRATION: &str = include_str!("../../migrations/0001_stock_ledger.sql");

const TRANSACTION_COLUMNS: &str = "id, product_id, location_id, operation_kind, quantity, quantity_delta, \
     quantity_before, quantity_after, operator_id, state, created_at, completed_at, updated_at, \
     updated_by, reversal_of, reversed_by, notes";

const STOCK_COLUMNS: &str = "product_id, location_id, quantity_on_hand, quantity_reserved, updated_at";

/// Opens raw Postgres connections for [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PgConnectionManager {
    options: PgConnectOptions,
}

impl PgConnectionManager {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Backend(format!("invalid database url: {e}")))?;
        Ok(Self { options })
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, PoolError> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    async fn is_valid(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }
}

/// Production ledger store.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: ConnectionPool<PgConnectionManager>,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: ConnectionPool<PgConnectionManager>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &ConnectionPool<PgConnectionManager> {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::raw_sql(MIGRATION)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await.map_err(|e| map_sqlx_error("ping", e))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn ensure_stock(&self, key: &StockKey, now: DateTime<Utc>) -> Result<StockRecord, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_stock_if_absent(&mut conn, key, now).await?;
        let row = sqlx::query(&format!(
            "SELECT {STOCK_COLUMNS} FROM stock_records WHERE product_id = $1 AND location_id = $2"
        ))
        .bind(&key.product_id)
        .bind(&key.location_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_stock", e))?;
        stock_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn list_stock(&self, product_id: &str) -> Result<Vec<StockRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {STOCK_COLUMNS} FROM stock_records WHERE product_id = $1 ORDER BY location_id"
        ))
        .bind(product_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_stock", e))?;
        rows.iter().map(stock_from_row).collect()
    }

    #[instrument(skip(self), fields(transaction_id = %id), err)]
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, id, false).await
    }

    #[instrument(skip(self), err)]
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("recent_transactions", e))?;
        rows.iter().map(transaction_from_row).collect()
    }

    #[instrument(
        skip(self, draft),
        fields(transaction_id = %id, key = %draft.key, kind = %draft.operation_kind, quantity = draft.quantity),
        err
    )]
    async fn apply_new(
        &self,
        id: TransactionId,
        draft: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
        set_lock_timeout(&mut tx, self.lock_timeout).await?;

        if let Some(existing) = fetch_transaction(&mut tx, id, false).await? {
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(existing);
        }

        let stock = lock_stock(&mut tx, &draft.key, now).await?;
        // Dropping `tx` on any early return rolls the unit back.
        let mut txn = Transaction::begin(id, draft, &stock, now)?;
        insert_transaction(&mut tx, &txn).await?;
        write_on_hand(&mut tx, &draft.key, txn.quantity_after, now).await?;
        txn.complete(now)?;
        update_transaction(&mut tx, &txn).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(txn)
    }

    #[instrument(skip(self, amendment), fields(transaction_id = %id), err)]
    async fn apply_amendment(
        &self,
        id: TransactionId,
        amendment: &Amendment,
        now: DateTime<Utc>,
    ) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
        set_lock_timeout(&mut tx, self.lock_timeout).await?;

        let mut txn = fetch_transaction(&mut tx, id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("transaction {id}")))?;
        let key = txn.key();
        let stock = lock_stock(&mut tx, &key, now).await?;

        let after = txn.amend(amendment, stock.quantity_on_hand, now)?;
        write_on_hand(&mut tx, &key, after, now).await?;
        update_transaction(&mut tx, &txn).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(txn)
    }

    #[instrument(skip(self), fields(transaction_id = %id, reversal_id = %reversal_id), err)]
    async fn apply_reversal(
        &self,
        id: TransactionId,
        reversal_id: TransactionId,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reversal, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await.map_err(|e| map_sqlx_error("begin", e))?;
        set_lock_timeout(&mut tx, self.lock_timeout).await?;

        let mut original = fetch_transaction(&mut tx, id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("transaction {id}")))?;

        if original.reversed_by == Some(reversal_id) {
            if let Some(compensating) = fetch_transaction(&mut tx, reversal_id, false).await? {
                tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
                return Ok(Reversal { original, compensating });
            }
        }

        let draft = original.reversal(operator_id)?;
        let stock = lock_stock(&mut tx, &draft.key, now).await?;
        let mut compensating = Transaction::begin(reversal_id, &draft, &stock, now)?;
        insert_transaction(&mut tx, &compensating).await?;
        write_on_hand(&mut tx, &draft.key, compensating.quantity_after, now).await?;
        compensating.complete(now)?;
        update_transaction(&mut tx, &compensating).await?;
        original.mark_reversed(reversal_id, &draft.operator_id, now)?;
        update_transaction(&mut tx, &original).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Reversal { original, compensating })
    }

    #[instrument(skip(self, txn), fields(transaction_id = %txn.id), err)]
    async fn record_failed(&self, txn: &Transaction) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_transaction(&mut conn, txn).await
    }

    async fn get_descriptor(&self, product_id: &str) -> Result<Option<ProductDescriptor>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            "SELECT product_id, code, default_location, created_at FROM product_descriptors WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("get_descriptor", e))?;
        row.as_ref().map(descriptor_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn ensure_descriptor(&self, product_id: &str, now: DateTime<Utc>) -> Result<ProductDescriptor, StoreError> {
        let derived = ProductDescriptor::derive(product_id, now);
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO product_descriptors (product_id, code, default_location, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (product_id) DO NOTHING
            "#,
        )
        .bind(&derived.product_id)
        .bind(&derived.code)
        .bind(&derived.default_location)
        .bind(derived.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_descriptor", e))?;

        let row = sqlx::query(
            "SELECT product_id, code, default_location, created_at FROM product_descriptors WHERE product_id = $1",
        )
        .bind(product_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("ensure_descriptor", e))?;
        descriptor_from_row(&row)
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

async fn set_lock_timeout(conn: &mut PgConnection, timeout: Duration) -> Result<(), StoreError> {
    // SET does not take bind parameters; the value is an integer we format ourselves.
    sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()))
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
    Ok(())
}

async fn insert_stock_if_absent(conn: &mut PgConnection, key: &StockKey, now: DateTime<Utc>) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_records (product_id, location_id, quantity_on_hand, quantity_reserved, updated_at)
        VALUES ($1, $2, 0, 0, $3)
        ON CONFLICT (product_id, location_id) DO NOTHING
        "#,
    )
    .bind(&key.product_id)
    .bind(&key.location_id)
    .bind(now)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_stock", e))?;
    Ok(())
}

/// Lazily create and row-lock the stock record for `key`.
async fn lock_stock(conn: &mut PgConnection, key: &StockKey, now: DateTime<Utc>) -> Result<StockRecord, StoreError> {
    insert_stock_if_absent(conn, key, now).await?;
    let row = sqlx::query(&format!(
        "SELECT {STOCK_COLUMNS} FROM stock_records WHERE product_id = $1 AND location_id = $2 FOR UPDATE"
    ))
    .bind(&key.product_id)
    .bind(&key.location_id)
    .fetch_one(conn)
    .await
    .map_err(|e| map_sqlx_error("lock_stock", e))?;
    stock_from_row(&row)
}

async fn write_on_hand(
    conn: &mut PgConnection,
    key: &StockKey,
    on_hand: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE stock_records SET quantity_on_hand = $3, updated_at = $4 WHERE product_id = $1 AND location_id = $2",
    )
    .bind(&key.product_id)
    .bind(&key.location_id)
    .bind(on_hand)
    .bind(now)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("write_on_hand", e))?;
    Ok(())
}

async fn fetch_transaction(
    conn: &mut PgConnection,
    id: TransactionId,
    for_update: bool,
) -> Result<Option<Transaction>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1{lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_transaction", e))?;
    row.as_ref().map(transaction_from_row).transpose()
}

async fn insert_transaction(conn: &mut PgConnection, txn: &Transaction) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, product_id, location_id, operation_kind, quantity, quantity_delta,
            quantity_before, quantity_after, operator_id, state, created_at, completed_at,
            updated_at, updated_by, reversal_of, reversed_by, notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(txn.id.as_uuid())
    .bind(&txn.product_id)
    .bind(&txn.location_id)
    .bind(txn.operation_kind.as_str())
    .bind(txn.quantity)
    .bind(txn.quantity_delta)
    .bind(txn.quantity_before)
    .bind(txn.quantity_after)
    .bind(&txn.operator_id)
    .bind(txn.state.as_str())
    .bind(txn.created_at)
    .bind(txn.completed_at)
    .bind(txn.updated_at)
    .bind(&txn.updated_by)
    .bind(txn.reversal_of.map(Uuid::from))
    .bind(txn.reversed_by.map(Uuid::from))
    .bind(&txn.notes)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_transaction", e))?;
    Ok(())
}

async fn update_transaction(conn: &mut PgConnection, txn: &Transaction) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE transactions SET
            operation_kind = $2, quantity = $3, quantity_delta = $4, quantity_before = $5,
            quantity_after = $6, state = $7, completed_at = $8, updated_at = $9,
            updated_by = $10, reversed_by = $11, notes = $12
        WHERE id = $1
        "#,
    )
    .bind(txn.id.as_uuid())
    .bind(txn.operation_kind.as_str())
    .bind(txn.quantity)
    .bind(txn.quantity_delta)
    .bind(txn.quantity_before)
    .bind(txn.quantity_after)
    .bind(txn.state.as_str())
    .bind(txn.completed_at)
    .bind(txn.updated_at)
    .bind(&txn.updated_by)
    .bind(txn.reversed_by.map(Uuid::from))
    .bind(&txn.notes)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_transaction", e))?;
    Ok(())
}

fn stock_from_row(row: &PgRow) -> Result<StockRecord, StoreError> {
    Ok(StockRecord {
        product_id: row.try_get("product_id").map_err(decode_error)?,
        location_id: row.try_get("location_id").map_err(decode_error)?,
        quantity_on_hand: row.try_get("quantity_on_hand").map_err(decode_error)?,
        quantity_reserved: row.try_get("quantity_reserved").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind: String = row.try_get("operation_kind").map_err(decode_error)?;
    let state: String = row.try_get("state").map_err(decode_error)?;
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let reversal_of: Option<Uuid> = row.try_get("reversal_of").map_err(decode_error)?;
    let reversed_by: Option<Uuid> = row.try_get("reversed_by").map_err(decode_error)?;

    Ok(Transaction {
        id: TransactionId::from_uuid(id),
        product_id: row.try_get("product_id").map_err(decode_error)?,
        location_id: row.try_get("location_id").map_err(decode_error)?,
        operation_kind: OperationKind::from_str(&kind).map_err(|e| StoreError::Backend(e.to_string()))?,
        quantity: row.try_get("quantity").map_err(decode_error)?,
        quantity_delta: row.try_get("quantity_delta").map_err(decode_error)?,
        quantity_before: row.try_get("quantity_before").map_err(decode_error)?,
        quantity_after: row.try_get("quantity_after").map_err(decode_error)?,
        operator_id: row.try_get("operator_id").map_err(decode_error)?,
        state: TransactionState::from_str(&state).map_err(|e| StoreError::Backend(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        updated_by: row.try_get("updated_by").map_err(decode_error)?,
        reversal_of: reversal_of.map(TransactionId::from_uuid),
        reversed_by: reversed_by.map(TransactionId::from_uuid),
        notes: row.try_get("notes").map_err(decode_error)?,
    })
}

fn descriptor_from_row(row: &PgRow) -> Result<ProductDescriptor, StoreError> {
    Ok(ProductDescriptor {
        product_id: row.try_get("product_id").map_err(decode_error)?,
        code: row.try_get("code").map_err(decode_error)?,
        default_location: row.try_get("default_location").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("failed to decode row: {err}"))
}

/// Classify a sqlx error. See the module docs for the table.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some(code) if is_transient_sqlstate(code) => StoreError::Transient(msg),
                Some(code) if code.starts_with("23") => StoreError::Constraint(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => StoreError::Transient(format!("pool timed out in {operation}")),
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03" | "57014") || code.starts_with("08")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_serialization_failures_are_transient() {
        for code in ["40001", "40P01", "55P03", "57014", "08006"] {
            assert!(is_transient_sqlstate(code), "{code}");
        }
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }

    #[test]
    fn io_errors_are_transient() {
        let err = map_sqlx_error(
            "apply_new",
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        );
        assert!(matches!(err, StoreError::Transient(_)));
        assert!(matches!(map_sqlx_error("x", sqlx::Error::RowNotFound), StoreError::Backend(_)));
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(PgConnectionManager::new("not a url").is_err());
    }
}
