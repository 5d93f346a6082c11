//! Machine-readable error payloads.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stockledger_infra::LedgerError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    InvalidState,
    InsufficientStock,
    NotFound,
    TransientStoreError,
    PersistentFailure,
    PoolExhausted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientStoreError => "transient_store_error",
            ErrorKind::PersistentFailure => "persistent_failure",
            ErrorKind::PoolExhausted => "pool_exhausted",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&LedgerError> for ErrorKind {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::Validation(_) => ErrorKind::ValidationError,
            LedgerError::InvalidState(_) => ErrorKind::InvalidState,
            LedgerError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::TransientStore(_) => ErrorKind::TransientStoreError,
            LedgerError::PersistentFailure(_) => ErrorKind::PersistentFailure,
            LedgerError::PoolExhausted(_) => ErrorKind::PoolExhausted,
        }
    }
}

/// Every failed operation answers with one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    /// Present for `insufficient_stock`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<i64>,
    pub elapsed_ms: f64,
}

impl ErrorResponse {
    pub fn from_ledger(err: &LedgerError, elapsed: Duration) -> Self {
        let (available, requested) = match err {
            LedgerError::InsufficientStock { available, requested } => (Some(*available), Some(*requested)),
            _ => (None, None),
        };
        Self {
            kind: ErrorKind::from(err),
            message: err.to_string(),
            available,
            requested,
            elapsed_ms: millis(elapsed),
        }
    }
}

impl core::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorResponse {}

pub(crate) fn millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_carries_quantities() {
        let err = LedgerError::InsufficientStock {
            available: 50,
            requested: 60,
        };
        let resp = ErrorResponse::from_ledger(&err, Duration::from_millis(3));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["kind"], "insufficient_stock");
        assert_eq!(json["available"], 50);
        assert_eq!(json["requested"], 60);
        assert_eq!(json["elapsed_ms"], 3.0);
    }

    #[test]
    fn kinds_serialize_as_their_names() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::PoolExhausted,
            ErrorKind::TransientStoreError,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
        let resp = ErrorResponse::from_ledger(&LedgerError::NotFound("transaction x".into()), Duration::ZERO);
        assert!(resp.available.is_none());
        assert_eq!(resp.kind, ErrorKind::NotFound);
    }
}
