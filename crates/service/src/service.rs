//! Transport-agnostic inventory operations.
//!
//! Each operation is timed, recorded in the metrics window and answered with an
//! [`OperationResponse`] or an [`ErrorResponse`]. A request-routing layer maps
//! its own calls onto these methods.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use stockledger_core::TransactionId;
use stockledger_infra::{LedgerEngine, LedgerResult, LedgerStore, Reversal};
use stockledger_ledger::{Amendment, NewTransaction, OperationKind, ProductDescriptor, StockKey, Transaction};
use stockledger_observability::{MetricsRecorder, MetricsSnapshot};

use crate::dto::{
    CacheHealth, CancelTransactionRequest, CreateTransactionRequest, HealthReport, HealthStatus, OperationResponse,
    StockStatus, StockStatusRequest, StoreHealth, UpdateTransactionRequest,
};
use crate::errors::{ErrorResponse, millis};

pub const DEFAULT_METRICS_LIMIT: usize = 100;

/// Window the health check summarises.
const HEALTH_WINDOW: usize = 100;

pub type ServiceResult<T> = Result<OperationResponse<T>, ErrorResponse>;

/// Store handle chosen by `database.backend`: Postgres, or in-memory when opted into.
pub type SharedStore = Arc<dyn LedgerStore>;

pub struct InventoryService<S = SharedStore> {
    engine: LedgerEngine<S>,
    metrics: MetricsRecorder,
}

impl<S> core::fmt::Debug for InventoryService<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InventoryService")
            .field("engine", &self.engine)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl<S: LedgerStore> InventoryService<S> {
    pub fn new(engine: LedgerEngine<S>, latency_budget: Duration, metrics_retention: usize) -> Self {
        Self {
            engine,
            metrics: MetricsRecorder::new(latency_budget, metrics_retention),
        }
    }

    pub fn engine(&self) -> &LedgerEngine<S> {
        &self.engine
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub async fn create_transaction(&self, req: CreateTransactionRequest) -> ServiceResult<Transaction> {
        self.timed("create_transaction", async move {
            let kind: OperationKind = req.operation_kind.parse()?;
            let mut draft = NewTransaction::new(&req.product_id, &req.location_id, kind, req.quantity, &req.operator_id)?;
            draft.notes = req.notes;
            self.engine.create(draft).await
        })
        .await
    }

    pub async fn update_transaction(&self, req: UpdateTransactionRequest) -> ServiceResult<Transaction> {
        self.timed("update_transaction", async move {
            let id: TransactionId = req.transaction_id.parse()?;
            let operation_kind = req
                .operation_kind
                .as_deref()
                .map(str::parse::<OperationKind>)
                .transpose()?;
            let amendment = Amendment {
                quantity: req.quantity,
                operation_kind,
                operator_id: req.operator_id,
                notes: req.notes,
            };
            self.engine.update(id, amendment).await
        })
        .await
    }

    pub async fn cancel_transaction(&self, req: CancelTransactionRequest) -> ServiceResult<Reversal> {
        self.timed("cancel_transaction", async move {
            let id: TransactionId = req.transaction_id.parse()?;
            self.engine.cancel(id, &req.operator_id).await
        })
        .await
    }

    pub async fn get_stock_status(&self, req: StockStatusRequest) -> ServiceResult<StockStatus> {
        self.timed("get_stock_status", self.stock_status(req)).await
    }

    /// Newest first. `limit` defaults to 50 and is clamped to 1..=1000.
    pub async fn get_transaction_history(&self, limit: Option<usize>) -> ServiceResult<Vec<Transaction>> {
        self.timed("get_transaction_history", self.engine.history(limit))
            .await
    }

    pub async fn get_transaction(&self, transaction_id: &str) -> ServiceResult<Transaction> {
        self.timed("get_transaction", async move {
            let id: TransactionId = transaction_id.parse()?;
            self.engine.transaction(id).await
        })
        .await
    }

    pub async fn get_product_descriptor(&self, product_id: &str) -> ServiceResult<ProductDescriptor> {
        self.timed("get_product_descriptor", self.engine.descriptor(product_id))
            .await
    }

    /// Never fails: an unreachable store is reported as `unhealthy`.
    pub async fn health_check(&self) -> OperationResponse<HealthReport> {
        let started = Instant::now();
        let engine = self.engine.health().await;

        let status = if !engine.store_reachable {
            HealthStatus::Unhealthy
        } else if engine.distributed_cache_healthy == Some(false) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        if status != HealthStatus::Healthy {
            warn!(?status, store_error = ?engine.store_error, "health check not healthy");
        }

        let report = HealthReport {
            status,
            store: StoreHealth {
                reachable: engine.store_reachable,
                error: engine.store_error,
                pool: engine.pool,
            },
            cache: CacheHealth {
                distributed_healthy: engine.distributed_cache_healthy,
                stock: engine.stock_cache,
                descriptor: engine.descriptor_cache,
            },
            events: engine.publisher,
            recent: self.metrics.overall(HEALTH_WINDOW),
            latency_budget_ms: budget_ms(self.metrics.budget()),
        };

        let elapsed = started.elapsed();
        OperationResponse {
            data: report,
            elapsed_ms: millis(elapsed),
            within_budget: self.metrics.within_budget(elapsed),
        }
    }

    /// Summary over the last `limit` operations (default 100).
    pub fn get_metrics(&self, limit: Option<usize>) -> MetricsSnapshot {
        self.metrics.snapshot(limit.unwrap_or(DEFAULT_METRICS_LIMIT))
    }

    async fn stock_status(&self, req: StockStatusRequest) -> LedgerResult<StockStatus> {
        match req.location_id {
            Some(location_id) => {
                let key = StockKey::new(&req.product_id, &location_id)?;
                Ok(StockStatus::Location(self.engine.location_status(&key).await?))
            }
            None => Ok(StockStatus::Product(self.engine.product_status(&req.product_id).await?)),
        }
    }

    async fn timed<T, Fut>(&self, operation: &'static str, work: Fut) -> ServiceResult<T>
    where
        Fut: Future<Output = LedgerResult<T>>,
    {
        let started = Instant::now();
        let result = work.await;
        let elapsed = started.elapsed();
        let record = self.metrics.record(operation, elapsed, result.is_ok());

        if !record.within_budget {
            warn!(
                operation,
                elapsed_ms = record.elapsed_ms,
                budget_ms = budget_ms(self.metrics.budget()),
                "operation exceeded latency budget"
            );
        }

        match result {
            Ok(data) => Ok(OperationResponse {
                data,
                elapsed_ms: record.elapsed_ms,
                within_budget: record.within_budget,
            }),
            Err(err) => {
                if err.is_store_failure() {
                    error!(operation, error = %err, "operation failed");
                } else {
                    info!(operation, error = %err, "operation rejected");
                }
                Err(ErrorResponse::from_ledger(&err, elapsed))
            }
        }
    }
}

fn budget_ms(budget: Duration) -> u64 {
    u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)
}
