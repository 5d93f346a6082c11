use serde::{Deserialize, Serialize};

use stockledger_infra::{CacheStats, PoolStats, PublisherStats};
use stockledger_ledger::{LocationStatus, ProductStatus};
use stockledger_observability::OperationSummary;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransactionRequest {
    pub product_id: String,
    pub location_id: String,
    /// `RECEIPT`, `PICK` or `RETURN` (case-insensitive).
    pub operation_kind: String,
    pub quantity: i64,
    pub operator_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTransactionRequest {
    pub transaction_id: String,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub operation_kind: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelTransactionRequest {
    pub transaction_id: String,
    /// Defaults to the system reversal operator when blank.
    #[serde(default)]
    pub operator_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockStatusRequest {
    pub product_id: String,
    /// Omit for the product-wide aggregate.
    #[serde(default)]
    pub location_id: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Every successful operation answers with one of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse<T> {
    pub data: T,
    pub elapsed_ms: f64,
    /// Advisory: false when the call exceeded the latency budget.
    pub within_budget: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StockStatus {
    Location(LocationStatus),
    Product(ProductStatus),
}

impl StockStatus {
    pub fn on_hand(&self) -> i64 {
        match self {
            StockStatus::Location(l) => l.on_hand,
            StockStatus::Product(p) => p.total_on_hand,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreHealth {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    /// `None` when no distributed tier is configured.
    pub distributed_healthy: Option<bool>,
    pub stock: CacheStats,
    pub descriptor: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: StoreHealth,
    pub cache: CacheHealth,
    pub events: PublisherStats,
    /// Over the last 100 operations.
    pub recent: OperationSummary,
    pub latency_budget_ms: u64,
}
