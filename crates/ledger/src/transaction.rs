use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, TransactionId};

use crate::operation::OperationKind;
use crate::stock::{StockKey, StockRecord};

/// Operator recorded on compensating transactions when the caller gives none.
pub const REVERSAL_OPERATOR: &str = "SYSTEM_REVERSAL";

/// Product and location of synthetic transactions.
pub const SYNTHETIC_PLACEHOLDER: &str = "UNKNOWN";

/// Lifecycle of a ledger transaction.
///
/// ```text
/// PROCESSING ──commit ok──▶ COMPLETED ──update──▶ UPDATED ──cancel──▶ REVERSED
///      │                        └────────────cancel─────────────────▶ REVERSED
///      └──commit fails──▶ FAILED
/// ```
///
/// REVERSED and FAILED are terminal. UPDATED may be updated again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Processing,
    Completed,
    Updated,
    Reversed,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Reversed | TransactionState::Failed)
    }

    /// Update and cancel are only legal from these states.
    pub fn is_amendable(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Updated)
    }

    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Updated)
                | (Completed, Reversed)
                | (Updated, Updated)
                | (Updated, Reversed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Processing => "PROCESSING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Updated => "UPDATED",
            TransactionState::Reversed => "REVERSED",
            TransactionState::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(TransactionState::Processing),
            "COMPLETED" => Ok(TransactionState::Completed),
            "UPDATED" => Ok(TransactionState::Updated),
            "REVERSED" => Ok(TransactionState::Reversed),
            "FAILED" => Ok(TransactionState::Failed),
            other => Err(DomainError::validation(format!(
                "unknown transaction state '{other}'"
            ))),
        }
    }
}

/// Validated request to move stock (the input of `create`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub key: StockKey,
    pub operation_kind: OperationKind,
    pub quantity: i64,
    pub operator_id: String,
    pub reversal_of: Option<TransactionId>,
    pub notes: Option<String>,
}

impl NewTransaction {
    pub fn new(
        product_id: impl AsRef<str>,
        location_id: impl AsRef<str>,
        operation_kind: OperationKind,
        quantity: i64,
        operator_id: impl AsRef<str>,
    ) -> DomainResult<Self> {
        let key = StockKey::new(product_id, location_id)?;
        validate_quantity(quantity)?;
        let operator_id = operator_id.as_ref().trim();
        if operator_id.is_empty() {
            return Err(DomainError::validation("operator_id cannot be empty"));
        }
        Ok(Self {
            key,
            operation_kind,
            quantity,
            operator_id: operator_id.to_string(),
            reversal_of: None,
            notes: None,
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn delta(&self) -> i64 {
        self.operation_kind.delta(self.quantity)
    }
}

/// Requested change to an existing transaction (the input of `update`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Amendment {
    pub quantity: Option<i64>,
    pub operation_kind: Option<OperationKind>,
    pub operator_id: Option<String>,
    pub notes: Option<String>,
}

impl Amendment {
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(q) = self.quantity {
            validate_quantity(q)?;
        }
        Ok(())
    }
}

fn validate_quantity(quantity: i64) -> DomainResult<()> {
    if quantity <= 0 {
        return Err(DomainError::validation("quantity must be greater than zero"));
    }
    // Keeps every delta/sum comfortably inside i64.
    if quantity > i64::MAX / 4 {
        return Err(DomainError::validation("quantity is too large"));
    }
    Ok(())
}

/// One stock-changing event plus its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub product_id: String,
    pub location_id: String,
    pub operation_kind: OperationKind,
    pub quantity: i64,
    pub quantity_delta: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub operator_id: String,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub reversal_of: Option<TransactionId>,
    pub reversed_by: Option<TransactionId>,
    pub notes: Option<String>,
}

impl Transaction {
    /// Start a transaction against the current stock record (state PROCESSING).
    ///
    /// Fails with `InsufficientStock` if the movement would drive on-hand negative.
    pub fn begin(
        id: TransactionId,
        draft: &NewTransaction,
        stock: &StockRecord,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let delta = draft.delta();
        let quantity_after = stock.quantity_after(delta)?;
        Ok(Self::processing(id, draft, stock.quantity_on_hand, quantity_after, now))
    }

    /// Audit record of an attempt whose atomic unit could not be committed.
    pub fn failed(
        id: TransactionId,
        draft: &NewTransaction,
        quantity_before: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let after = quantity_before.saturating_add(draft.delta());
        let mut tx = Self::processing(id, draft, quantity_before, after, now);
        tx.state = TransactionState::Failed;
        tx.completed_at = Some(now);
        tx.notes = Some(reason.to_string());
        tx
    }

    fn processing(
        id: TransactionId,
        draft: &NewTransaction,
        quantity_before: i64,
        quantity_after: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id: draft.key.product_id.clone(),
            location_id: draft.key.location_id.clone(),
            operation_kind: draft.operation_kind,
            quantity: draft.quantity,
            quantity_delta: draft.delta(),
            quantity_before,
            quantity_after,
            operator_id: draft.operator_id.clone(),
            state: TransactionState::Processing,
            created_at: now,
            completed_at: None,
            updated_at: None,
            updated_by: None,
            reversal_of: draft.reversal_of,
            reversed_by: None,
            notes: draft.notes.clone(),
        }
    }

    /// Stand-in returned for an unknown id when the caller opted into
    /// fabrication. Has no stock effect and is never stored.
    pub fn synthetic(
        id: TransactionId,
        state: TransactionState,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id: SYNTHETIC_PLACEHOLDER.to_string(),
            location_id: SYNTHETIC_PLACEHOLDER.to_string(),
            operation_kind: OperationKind::Receipt,
            quantity: 0,
            quantity_delta: 0,
            quantity_before: 0,
            quantity_after: 0,
            operator_id: operator_id.to_string(),
            state,
            created_at: now,
            completed_at: Some(now),
            updated_at: Some(now),
            updated_by: Some(operator_id.to_string()),
            reversal_of: None,
            reversed_by: None,
            notes: Some("synthetic: transaction not present in the ledger".to_string()),
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey {
            product_id: self.product_id.clone(),
            location_id: self.location_id.clone(),
        }
    }

    fn transition(&mut self, next: TransactionState) -> DomainResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_state(format!(
                "transaction {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TransactionState::Completed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn ensure_amendable(&self) -> DomainResult<()> {
        if self.state.is_amendable() {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!(
                "transaction {} is {}; only COMPLETED or UPDATED transactions can be changed",
                self.id, self.state
            )))
        }
    }

    /// Re-base this transaction on `on_hand` with its own delta reverted and the
    /// amended delta applied. Returns the new quantity-on-hand.
    ///
    /// On error the transaction is left untouched.
    pub fn amend(
        &mut self,
        amendment: &Amendment,
        on_hand: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<i64> {
        self.ensure_amendable()?;
        amendment.validate()?;

        let kind = amendment.operation_kind.unwrap_or(self.operation_kind);
        let quantity = amendment.quantity.unwrap_or(self.quantity);
        let new_delta = kind.delta(quantity);

        let base = on_hand
            .checked_sub(self.quantity_delta)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        let after = base
            .checked_add(new_delta)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        if after < 0 {
            return Err(DomainError::insufficient_stock(
                on_hand,
                self.quantity_delta.saturating_sub(new_delta),
            ));
        }

        self.transition(TransactionState::Updated)?;
        self.operation_kind = kind;
        self.quantity = quantity;
        self.quantity_delta = new_delta;
        self.quantity_before = base;
        self.quantity_after = after;
        self.updated_at = Some(now);
        if let Some(op) = amendment.operator_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            self.updated_by = Some(op.to_string());
        }
        if let Some(notes) = &amendment.notes {
            self.notes = Some(notes.clone());
        }
        Ok(after)
    }

    /// Compensating movement for this transaction.
    pub fn reversal(&self, operator_id: &str) -> DomainResult<NewTransaction> {
        self.ensure_amendable()?;
        let operator = match operator_id.trim() {
            "" => REVERSAL_OPERATOR,
            op => op,
        };
        let mut draft = NewTransaction::new(
            &self.product_id,
            &self.location_id,
            self.operation_kind.inverse(),
            self.quantity,
            operator,
        )?;
        draft.reversal_of = Some(self.id);
        draft.notes = Some(format!("reversal of {}", self.id));
        Ok(draft)
    }

    pub fn mark_reversed(
        &mut self,
        reversal_id: TransactionId,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_amendable()?;
        self.transition(TransactionState::Reversed)?;
        self.reversed_by = Some(reversal_id);
        self.updated_at = Some(now);
        self.updated_by = Some(operator_id.to_string());
        self.notes = Some(format!("reversed by {reversal_id}"));
        Ok(())
    }
}
