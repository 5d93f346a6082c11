use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::TransactionId;
use stockledger_events::Event;

use crate::operation::OperationKind;
use crate::transaction::{Transaction, TransactionState};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    TransactionCompleted,
    TransactionUpdated,
    TransactionReversed,
    TransactionFailed,
    /// On-hand dropped to or below the low-stock threshold after a commit.
    StockLow,
}

/// Event: a committed (or failed) change to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub transaction_id: TransactionId,
    pub product_id: String,
    pub location_id: String,
    pub operation_kind: OperationKind,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub state: TransactionState,
    pub elapsed_ms: u64,
    pub occurred_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn from_transaction(
        kind: LedgerEventKind,
        tx: &Transaction,
        elapsed_ms: u64,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            transaction_id: tx.id,
            product_id: tx.product_id.clone(),
            location_id: tx.location_id.clone(),
            operation_kind: tx.operation_kind,
            quantity_before: tx.quantity_before,
            quantity_after: tx.quantity_after,
            state: tx.state,
            elapsed_ms,
            occurred_at,
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            LedgerEventKind::TransactionCompleted => "inventory.transaction.completed",
            LedgerEventKind::TransactionUpdated => "inventory.transaction.updated",
            LedgerEventKind::TransactionReversed => "inventory.transaction.reversed",
            LedgerEventKind::TransactionFailed => "inventory.transaction.failed",
            LedgerEventKind::StockLow => "inventory.stock.low",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    fn partition_key(&self) -> String {
        format!("{}:{}", self.product_id, self.location_id)
    }
}
