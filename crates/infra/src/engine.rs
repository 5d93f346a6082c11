//! Stock ledger transaction engine.
//!
//! Composes the store (authoritative, atomic units), the retry executor, the
//! two cache instances and the event publisher:
//!
//! ```text
//! request
//!   ↓
//! 1. validate (pure, no retry)
//!   ↓
//! 2. pre-check against the cached stock record (fast path)
//!   ↓
//! 3. atomic unit in the store, under retry + per-call timeout
//!   ↓
//! 4. delete the key from both cache tiers
//!   ↓
//! 5. publish events (fire and forget)
//! ```
//!
//! The store re-checks every business rule under its own lock, so the cached
//! pre-check can only reject early, never admit something the store would refuse.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use stockledger_core::{DomainError, TransactionId};
use stockledger_ledger::{
    Amendment, LedgerEvent, LedgerEventKind, LocationStatus, NewTransaction, ProductDescriptor, ProductStatus,
    StockKey, StockRecord, Transaction, TransactionState,
};

use crate::cache::{CacheStats, TieredCache};
use crate::config::MissingTransaction;
use crate::error::{LedgerError, LedgerResult};
use crate::pool::PoolStats;
use crate::publisher::{EventPublisher, PublisherStats};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::{LedgerStore, Reversal, StoreError};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 1_000;

pub const DEFAULT_STOCK_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_DESCRIPTOR_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on one store call; a call exceeding it is retried as transient.
    pub operation_timeout: Duration,
    /// Commits leaving on-hand at or below this also emit `inventory.stock.low`.
    pub low_stock_threshold: i64,
    pub missing_transaction: MissingTransaction,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            low_stock_threshold: 10,
            missing_transaction: MissingTransaction::Strict,
        }
    }
}

/// Snapshot of the engine's collaborators for health reporting.
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub store_reachable: bool,
    pub store_error: Option<String>,
    pub pool: PoolStats,
    pub stock_cache: CacheStats,
    pub descriptor_cache: CacheStats,
    /// `None` when no distributed tier is configured.
    pub distributed_cache_healthy: Option<bool>,
    pub publisher: PublisherStats,
}

pub struct LedgerEngine<S> {
    store: S,
    retry: RetryExecutor,
    stock_cache: TieredCache<StockRecord>,
    descriptor_cache: TieredCache<ProductDescriptor>,
    publisher: EventPublisher,
    options: EngineOptions,
}

impl<S> core::fmt::Debug for LedgerEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("retry", &self.retry)
            .field("stock_cache", &self.stock_cache)
            .field("descriptor_cache", &self.descriptor_cache)
            .field("publisher", &self.publisher)
            .field("options", &self.options)
            .finish()
    }
}

impl<S: LedgerStore> LedgerEngine<S> {
    /// Engine with default retry policy, local-only caches and no event sinks.
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryExecutor::default(),
            stock_cache: TieredCache::new("stock", DEFAULT_STOCK_TTL),
            descriptor_cache: TieredCache::new("desc", DEFAULT_DESCRIPTOR_TTL),
            publisher: EventPublisher::disabled(),
            options: EngineOptions::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryExecutor::new(policy);
        self
    }

    pub fn with_stock_cache(mut self, cache: TieredCache<StockRecord>) -> Self {
        self.stock_cache = cache;
        self
    }

    pub fn with_descriptor_cache(mut self, cache: TieredCache<ProductDescriptor>) -> Self {
        self.descriptor_cache = cache;
        self
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stock_cache(&self) -> &TieredCache<StockRecord> {
        &self.stock_cache
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Record a stock movement.
    #[instrument(
        skip(self, draft),
        fields(key = %draft.key, kind = %draft.operation_kind, quantity = draft.quantity)
    )]
    pub async fn create(&self, draft: NewTransaction) -> LedgerResult<Transaction> {
        let started = Instant::now();
        let on_hand = self.precheck(&draft).await?;

        let id = TransactionId::new();
        let result = self
            .run_unit("apply_new", || self.store.apply_new(id, &draft, Utc::now()))
            .await;

        match result {
            Ok(tx) => {
                self.invalidate_stock(&draft.key).await;
                info!(
                    transaction_id = %tx.id,
                    before = tx.quantity_before,
                    after = tx.quantity_after,
                    "transaction committed"
                );
                self.emit(LedgerEventKind::TransactionCompleted, &tx, started);
                Ok(tx)
            }
            Err(e) => {
                if e.is_store_failure() {
                    // The unit may or may not have landed; drop whatever the cache holds.
                    self.invalidate_stock(&draft.key).await;
                    if !matches!(e, LedgerError::PoolExhausted(_)) {
                        self.audit_failure(id, &draft, on_hand, &e, started).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Change quantity and/or kind of a COMPLETED or UPDATED transaction.
    #[instrument(skip(self, amendment), fields(transaction_id = %id))]
    pub async fn update(&self, id: TransactionId, amendment: Amendment) -> LedgerResult<Transaction> {
        let started = Instant::now();
        amendment.validate()?;

        let result = self
            .run_unit("apply_amendment", || self.store.apply_amendment(id, &amendment, Utc::now()))
            .await;

        match result {
            Ok(tx) => {
                self.invalidate_stock(&tx.key()).await;
                info!(
                    before = tx.quantity_before,
                    after = tx.quantity_after,
                    kind = %tx.operation_kind,
                    "transaction updated"
                );
                self.emit(LedgerEventKind::TransactionUpdated, &tx, started);
                Ok(tx)
            }
            Err(LedgerError::NotFound(msg)) if self.fabricates() => {
                warn!(%msg, "fabricating updated transaction for unknown id");
                let operator = amendment.operator_id.as_deref().unwrap_or_default();
                Ok(Transaction::synthetic(id, TransactionState::Updated, operator, Utc::now()))
            }
            Err(e) => {
                if e.is_store_failure() {
                    self.invalidate_for(id).await;
                }
                Err(e)
            }
        }
    }

    /// Reverse a COMPLETED or UPDATED transaction with a compensating one.
    #[instrument(skip(self), fields(transaction_id = %id))]
    pub async fn cancel(&self, id: TransactionId, operator_id: &str) -> LedgerResult<Reversal> {
        let started = Instant::now();
        let reversal_id = TransactionId::new();

        let result = self
            .run_unit("apply_reversal", || {
                self.store.apply_reversal(id, reversal_id, operator_id, Utc::now())
            })
            .await;

        match result {
            Ok(reversal) => {
                self.invalidate_stock(&reversal.compensating.key()).await;
                info!(
                    reversal_id = %reversal.compensating.id,
                    after = reversal.compensating.quantity_after,
                    "transaction reversed"
                );
                self.emit(LedgerEventKind::TransactionReversed, &reversal.original, started);
                self.emit(LedgerEventKind::TransactionCompleted, &reversal.compensating, started);
                Ok(reversal)
            }
            Err(LedgerError::NotFound(msg)) if self.fabricates() => {
                warn!(%msg, "fabricating reversal for unknown id");
                let now = Utc::now();
                let mut original = Transaction::synthetic(id, TransactionState::Reversed, operator_id, now);
                original.reversed_by = Some(reversal_id);
                let mut compensating =
                    Transaction::synthetic(reversal_id, TransactionState::Completed, operator_id, now);
                compensating.reversal_of = Some(id);
                Ok(Reversal { original, compensating })
            }
            Err(e) => {
                if e.is_store_failure() {
                    self.invalidate_for(id).await;
                }
                Err(e)
            }
        }
    }

    /// Stock at one location, read through the cache.
    pub async fn location_status(&self, key: &StockKey) -> LedgerResult<LocationStatus> {
        Ok(self.cached_stock(key).await?.status())
    }

    /// Stock across every known location of `product_id`.
    ///
    /// The set of locations comes from the store; each location's figures are
    /// read through the cache.
    pub async fn product_status(&self, product_id: &str) -> LedgerResult<ProductStatus> {
        let product_id = non_blank(product_id, "product_id")?;
        let records = self
            .run_unit("list_stock", || self.store.list_stock(product_id))
            .await?;

        let mut locations = Vec::with_capacity(records.len());
        for record in records {
            locations.push(self.cached_stock(&record.key()).await?.status());
        }
        Ok(ProductStatus::aggregate(product_id, locations)?)
    }

    /// Most recent transactions, newest first. `limit` defaults to 50, clamped to 1..=1000.
    pub async fn history(&self, limit: Option<usize>) -> LedgerResult<Vec<Transaction>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.run_unit("recent_transactions", || self.store.recent_transactions(limit))
            .await
    }

    pub async fn transaction(&self, id: TransactionId) -> LedgerResult<Transaction> {
        self.run_unit("get_transaction", || self.store.get_transaction(id))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
    }

    /// Static product attributes, served from the long-TTL cache.
    pub async fn descriptor(&self, product_id: &str) -> LedgerResult<ProductDescriptor> {
        let product_id = non_blank(product_id, "product_id")?;
        let key = self.descriptor_cache.key(&[product_id]);
        self.descriptor_cache
            .get_or_load(&key, || {
                self.run_unit("ensure_descriptor", || self.store.ensure_descriptor(product_id, Utc::now()))
            })
            .await
    }

    /// Probe collaborators. A single store ping, no retries.
    pub async fn health(&self) -> EngineHealth {
        let ping = match tokio::time::timeout(self.options.operation_timeout, self.store.ping()).await {
            Ok(r) => r.map_err(|e| e.to_string()),
            Err(_) => Err(format!("ping timed out after {:?}", self.options.operation_timeout)),
        };

        let stock_healthy = self.stock_cache.distributed_healthy().await;
        let descriptor_healthy = self.descriptor_cache.distributed_healthy().await;
        let distributed_cache_healthy = match (stock_healthy, descriptor_healthy) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(true) && b.unwrap_or(true)),
        };

        EngineHealth {
            store_reachable: ping.is_ok(),
            store_error: ping.err(),
            pool: self.store.pool_stats(),
            stock_cache: self.stock_cache.stats(),
            descriptor_cache: self.descriptor_cache.stats(),
            distributed_cache_healthy,
            publisher: self.publisher.stats(),
        }
    }

    fn fabricates(&self) -> bool {
        self.options.missing_transaction == MissingTransaction::Fabricate
    }

    /// Run one store call under the retry policy, each attempt bounded by the operation timeout.
    async fn run_unit<T, F, Fut>(&self, operation: &str, mut work: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.options.operation_timeout;
        self.retry
            .run(operation, || {
                let unit = work();
                async move {
                    match tokio::time::timeout(timeout, unit).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Transient(format!("{operation} timed out after {timeout:?}"))),
                    }
                }
            })
            .await
            .map_err(LedgerError::from)
    }

    async fn cached_stock(&self, key: &StockKey) -> LedgerResult<StockRecord> {
        let cache_key = self.stock_key(key);
        self.stock_cache
            .get_or_load(&cache_key, || {
                self.run_unit("ensure_stock", || self.store.ensure_stock(key, Utc::now()))
            })
            .await
    }

    /// Fast rejection against the cached record. Returns the on-hand it saw.
    ///
    /// A rejection is only trusted after evicting the key and reading it again,
    /// so a stale cache entry never refuses a movement the store would accept.
    async fn precheck(&self, draft: &NewTransaction) -> LedgerResult<i64> {
        let record = self.cached_stock(&draft.key).await?;
        match record.quantity_after(draft.delta()) {
            Ok(_) => Ok(record.quantity_on_hand),
            Err(DomainError::InsufficientStock { .. }) => {
                self.invalidate_stock(&draft.key).await;
                let fresh = self.cached_stock(&draft.key).await?;
                fresh.quantity_after(draft.delta())?;
                Ok(fresh.quantity_on_hand)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stock_key(&self, key: &StockKey) -> String {
        self.stock_cache.key(&[&key.product_id, &key.location_id])
    }

    async fn invalidate_stock(&self, key: &StockKey) {
        self.stock_cache.invalidate(&self.stock_key(key)).await;
    }

    /// Best-effort eviction after an ambiguous failure on an existing transaction.
    async fn invalidate_for(&self, id: TransactionId) {
        if let Ok(Some(tx)) = self.store.get_transaction(id).await {
            self.invalidate_stock(&tx.key()).await;
        }
    }

    /// Record a FAILED audit transaction and announce it. Never fails the caller further.
    async fn audit_failure(
        &self,
        id: TransactionId,
        draft: &NewTransaction,
        on_hand: i64,
        cause: &LedgerError,
        started: Instant,
    ) {
        let failed = Transaction::failed(id, draft, on_hand, &cause.to_string(), Utc::now());
        error!(transaction_id = %id, error = %cause, "atomic unit failed; recording FAILED audit entry");

        let recorded = tokio::time::timeout(self.options.operation_timeout, self.store.record_failed(&failed)).await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(transaction_id = %id, error = %e, "could not record FAILED audit entry"),
            Err(_) => warn!(transaction_id = %id, "recording FAILED audit entry timed out"),
        }
        self.emit(LedgerEventKind::TransactionFailed, &failed, started);
    }

    fn emit(&self, kind: LedgerEventKind, tx: &Transaction, started: Instant) {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let now = Utc::now();
        self.publisher
            .publish(&LedgerEvent::from_transaction(kind, tx, elapsed_ms, now));

        let moves_stock = matches!(
            kind,
            LedgerEventKind::TransactionCompleted | LedgerEventKind::TransactionUpdated
        );
        if moves_stock && tx.quantity_after <= self.options.low_stock_threshold {
            self.publisher
                .publish(&LedgerEvent::from_transaction(LedgerEventKind::StockLow, tx, elapsed_ms, now));
        }
    }
}

fn non_blank<'a>(value: &'a str, field: &str) -> LedgerResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::Validation(format!("{field} cannot be empty")));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::Value as JsonValue;
    use stockledger_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use stockledger_ledger::OperationKind;

    use crate::cache::InMemoryTtlStore;
    use crate::store::{Fault, InMemoryLedgerStore};

    type Bus = InMemoryEventBus<EventEnvelope<JsonValue>>;

    fn engine() -> Engine {
        LedgerEngine::new(Arc::new(InMemoryLedgerStore::new()))
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    fn draft(kind: OperationKind, qty: i64) -> NewTransaction {
        NewTransaction::new("widget", "A1", kind, qty, "op-1").unwrap()
    }

    fn key() -> StockKey {
        StockKey::new("widget", "A1").unwrap()
    }

    type Engine = LedgerEngine<Arc<InMemoryLedgerStore>>;

    fn with_bus(engine: Engine) -> (Engine, Subscription<EventEnvelope<JsonValue>>) {
        let bus: Arc<Bus> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        (engine.with_publisher(EventPublisher::new().with_sink(bus)), sub)
    }

    fn event_types(sub: &Subscription<EventEnvelope<JsonValue>>, n: usize) -> Vec<String> {
        let mut types: Vec<String> = (0..n)
            .map(|_| sub.recv_timeout(Duration::from_secs(2)).unwrap().event_type().to_string())
            .collect();
        types.sort();
        types
    }

    #[tokio::test]
    async fn create_commits_and_invalidates() {
        let engine = engine();
        // Warm the cache with the empty record.
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 0);

        let tx = engine.create(draft(OperationKind::Receipt, 50)).await.unwrap();
        assert_eq!((tx.quantity_before, tx.quantity_after), (0, 50));
        assert_eq!(tx.state, TransactionState::Completed);
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 50);
    }

    #[tokio::test]
    async fn stale_cache_does_not_reject_a_valid_pick() {
        let engine = engine();
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 0);

        // Another engine instance receives stock behind this one's cache.
        let mut record = StockRecord::empty(&key(), Utc::now());
        record.quantity_on_hand = 40;
        engine.store().seed_stock(record);

        let tx = engine.create(draft(OperationKind::Pick, 30)).await.unwrap();
        assert_eq!((tx.quantity_before, tx.quantity_after), (40, 10));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let engine = engine();
        engine.store().fail_next(2, Fault::Transient);

        let tx = engine.create(draft(OperationKind::Receipt, 5)).await.unwrap();
        assert_eq!(tx.quantity_after, 5);
        assert_eq!(engine.store().units_attempted(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_record_a_failed_audit_entry() {
        let (engine, sub) = with_bus(engine());
        engine.store().fail_next(4, Fault::Transient);

        let err = engine.create(draft(OperationKind::Receipt, 5)).await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistentFailure(_)));
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 0);

        let history = engine.history(None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, TransactionState::Failed);
        assert_eq!(event_types(&sub, 1), vec!["inventory.transaction.failed"]);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let engine = engine();
        engine.store().fail_next(1, Fault::Permanent);

        let err = engine.create(draft(OperationKind::Receipt, 5)).await.unwrap_err();
        assert!(matches!(err, LedgerError::PersistentFailure(_)));
        assert_eq!(engine.store().units_attempted(), 1);
    }

    #[tokio::test]
    async fn slow_store_times_out_as_transient() {
        let engine = engine().with_options(EngineOptions {
            operation_timeout: Duration::from_millis(20),
            ..EngineOptions::default()
        });
        engine.store().set_latency(Some(Duration::from_millis(200)));

        let err = engine.location_status(&key()).await.unwrap_err();
        match err {
            LedgerError::PersistentFailure(msg) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_rebases_and_rejects_negative_results() {
        let engine = engine();
        let receipt = engine.create(draft(OperationKind::Receipt, 50)).await.unwrap();
        engine.create(draft(OperationKind::Pick, 30)).await.unwrap();

        // Turning the receipt into a pick would need 70 more than we have.
        let err = engine
            .update(
                receipt.id,
                Amendment {
                    operation_kind: Some(OperationKind::Pick),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 20);
        assert_eq!(engine.transaction(receipt.id).await.unwrap().state, TransactionState::Completed);

        let updated = engine
            .update(
                receipt.id,
                Amendment {
                    quantity: Some(80),
                    operator_id: Some("op-2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.state, TransactionState::Updated);
        assert_eq!(updated.updated_by.as_deref(), Some("op-2"));
        // Rebased: the original +50 is reverted from 20 on hand, then +80 applied.
        assert_eq!((updated.quantity_before, updated.quantity_after), (-30, 50));
        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 50);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found_unless_fabricating() {
        let strict = engine();
        let err = strict.cancel(TransactionId::new(), "op").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));

        let permissive = engine().with_options(EngineOptions {
            missing_transaction: MissingTransaction::Fabricate,
            ..EngineOptions::default()
        });
        let id = TransactionId::new();
        let reversal = permissive.cancel(id, "op").await.unwrap();
        assert_eq!(reversal.original.id, id);
        assert_eq!(reversal.original.state, TransactionState::Reversed);
        assert!(permissive.history(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn low_stock_is_announced() {
        let (engine, sub) = with_bus(engine());
        engine.create(draft(OperationKind::Receipt, 5)).await.unwrap();
        assert_eq!(
            event_types(&sub, 2),
            vec!["inventory.stock.low", "inventory.transaction.completed"]
        );
    }

    #[tokio::test]
    async fn distributed_outage_is_reported_but_reads_work() {
        let tier = Arc::new(InMemoryTtlStore::new());
        tier.set_unavailable(true);
        let engine = engine().with_stock_cache(
            TieredCache::new("stock", DEFAULT_STOCK_TTL).with_distributed(tier),
        );

        assert_eq!(engine.location_status(&key()).await.unwrap().on_hand, 0);
        let health = engine.health().await;
        assert!(health.store_reachable);
        assert_eq!(health.distributed_cache_healthy, Some(false));
    }

    #[tokio::test]
    async fn history_is_clamped() {
        let engine = engine();
        for _ in 0..3 {
            engine.create(draft(OperationKind::Receipt, 1)).await.unwrap();
        }
        assert_eq!(engine.history(Some(0)).await.unwrap().len(), 1);
        assert_eq!(engine.history(Some(2)).await.unwrap().len(), 2);
        assert_eq!(engine.history(Some(5_000)).await.unwrap().len(), 3);
    }
}
