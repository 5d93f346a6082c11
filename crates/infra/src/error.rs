//! Engine-facing error taxonomy.

use thiserror::Error;

use stockledger_core::DomainError;

use crate::pool::PoolError;
use crate::retry::RetryError;
use crate::store::StoreError;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Everything a ledger operation can fail with.
///
/// Validation, InvalidState, InsufficientStock and NotFound are deterministic
/// and never retried. Transient store failures are retried inside the engine
/// and surface as PersistentFailure once the budget is spent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient store failure: {0}")]
    TransientStore(String),

    #[error("persistent store failure: {0}")]
    PersistentFailure(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
}

impl LedgerError {
    /// Failures of the store itself, as opposed to business-rule rejections.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LedgerError::TransientStore(_) | LedgerError::PersistentFailure(_) | LedgerError::PoolExhausted(_)
        )
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidState(msg) => LedgerError::InvalidState(msg),
            DomainError::InsufficientStock { available, requested } => {
                LedgerError::InsufficientStock { available, requested }
            }
            DomainError::NotFound(msg) => LedgerError::NotFound(msg),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(e) => e.into(),
            StoreError::Transient(msg) => LedgerError::TransientStore(msg),
            StoreError::Pool(PoolError::Exhausted(wait)) => {
                LedgerError::PoolExhausted(format!("no connection available within {wait:?}"))
            }
            StoreError::Pool(e @ PoolError::Connect(_)) => LedgerError::TransientStore(e.to_string()),
            StoreError::Pool(e @ PoolError::Closed) => LedgerError::PersistentFailure(e.to_string()),
            StoreError::Constraint(msg) | StoreError::Backend(msg) => LedgerError::PersistentFailure(msg),
        }
    }
}

impl From<RetryError<StoreError>> for LedgerError {
    fn from(value: RetryError<StoreError>) -> Self {
        match value {
            RetryError::Exhausted { attempts, last } => {
                LedgerError::PersistentFailure(format!("gave up after {attempts} attempts: {last}"))
            }
            RetryError::Permanent(e) => e.into(),
        }
    }
}
