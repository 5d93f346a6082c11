//! Stock ledger domain module.
//!
//! This crate contains the business rules of the ledger, implemented purely as
//! deterministic domain logic (no IO, no async, no storage): operation kinds and
//! their inverses, the transaction state machine, stock records and status
//! aggregation.

pub mod descriptor;
pub mod event;
pub mod operation;
pub mod stock;
pub mod transaction;

pub use descriptor::ProductDescriptor;
pub use event::{LedgerEvent, LedgerEventKind};
pub use operation::OperationKind;
pub use stock::{LocationStatus, ProductStatus, StockKey, StockRecord};
pub use transaction::{
    Amendment, NewTransaction, REVERSAL_OPERATOR, SYNTHETIC_PLACEHOLDER, Transaction, TransactionState,
};
