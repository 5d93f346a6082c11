//! Inventory service: the operations callers use, composed from the ledger
//! engine, caches, event publisher and metrics.

pub mod dto;
pub mod errors;
pub mod service;
pub mod wiring;

pub use dto::{
    CancelTransactionRequest, CreateTransactionRequest, HealthReport, HealthStatus, OperationResponse, StockStatus,
    StockStatusRequest, UpdateTransactionRequest,
};
pub use errors::{ErrorKind, ErrorResponse};
pub use service::{InventoryService, ServiceResult, SharedStore};
