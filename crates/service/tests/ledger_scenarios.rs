use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use stockledger_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use stockledger_infra::engine::EngineOptions;
use stockledger_infra::store::Fault;
use stockledger_infra::{
    EventPublisher, InMemoryLedgerStore, InMemoryTtlStore, LedgerEngine, MissingTransaction, RetryPolicy, TieredCache,
};
use stockledger_ledger::{OperationKind, SYNTHETIC_PLACEHOLDER, TransactionState};
use stockledger_service::{
    CancelTransactionRequest, CreateTransactionRequest, ErrorKind, HealthStatus, InventoryService, StockStatus,
    StockStatusRequest, UpdateTransactionRequest,
};

type Store = Arc<InMemoryLedgerStore>;
type Service = InventoryService<Store>;
type Engine = LedgerEngine<Store>;

fn engine(store: InMemoryLedgerStore) -> Engine {
    LedgerEngine::new(Arc::new(store)).with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)))
}

fn service() -> Service {
    wrap(engine(InMemoryLedgerStore::new()))
}

fn wrap(engine: Engine) -> Service {
    InventoryService::new(engine, Duration::from_millis(500), 10_000)
}

fn create(product: &str, location: &str, kind: &str, quantity: i64) -> CreateTransactionRequest {
    CreateTransactionRequest {
        product_id: product.to_string(),
        location_id: location.to_string(),
        operation_kind: kind.to_string(),
        quantity,
        operator_id: "op-7".to_string(),
        notes: None,
    }
}

fn cancel(id: impl ToString) -> CancelTransactionRequest {
    CancelTransactionRequest {
        transaction_id: id.to_string(),
        operator_id: "supervisor".to_string(),
    }
}

async fn on_hand(service: &Service, product: &str, location: &str) -> i64 {
    service
        .get_stock_status(StockStatusRequest {
            product_id: product.to_string(),
            location_id: Some(location.to_string()),
        })
        .await
        .unwrap()
        .data
        .on_hand()
}

#[tokio::test]
async fn receipt_on_a_fresh_key_starts_from_zero() {
    let service = service();

    let resp = service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap();
    let tx = resp.data;
    assert_eq!(tx.quantity_before, 0);
    assert_eq!(tx.quantity_after, 50);
    assert_eq!(tx.state, TransactionState::Completed);
    assert!(tx.completed_at.is_some());
    assert!(resp.within_budget);
    assert_eq!(on_hand(&service, "widget", "A1").await, 50);
}

#[tokio::test]
async fn overdrawing_pick_is_rejected_without_side_effects() {
    let service = service();
    service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap();

    let err = service.create_transaction(create("widget", "A1", "PICK", 60)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientStock);
    assert_eq!(err.available, Some(50));
    assert_eq!(err.requested, Some(60));
    assert_eq!(on_hand(&service, "widget", "A1").await, 50);

    let history = service.get_transaction_history(None).await.unwrap().data;
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn cancel_posts_a_compensating_transaction() {
    let service = service();
    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap().data;

    let reversal = service.cancel_transaction(cancel(receipt.id)).await.unwrap().data;
    assert_eq!(reversal.original.state, TransactionState::Reversed);
    assert_eq!(reversal.original.reversed_by, Some(reversal.compensating.id));
    assert_eq!(reversal.compensating.operation_kind, OperationKind::Pick);
    assert_eq!(reversal.compensating.quantity, 50);
    assert_eq!(reversal.compensating.reversal_of, Some(receipt.id));
    assert_eq!(reversal.compensating.quantity_after, 0);
    assert_eq!(on_hand(&service, "widget", "A1").await, 0);

    let stored = service.get_transaction(&receipt.id.to_string()).await.unwrap().data;
    assert_eq!(stored.state, TransactionState::Reversed);
}

#[tokio::test]
async fn product_status_sums_every_location() {
    let service = service();
    service.create_transaction(create("widget", "A1", "RECEIPT", 30)).await.unwrap();
    service.create_transaction(create("widget", "B2", "RECEIPT", 20)).await.unwrap();
    service.create_transaction(create("gadget", "A1", "RECEIPT", 99)).await.unwrap();

    let status = service
        .get_stock_status(StockStatusRequest {
            product_id: "widget".to_string(),
            location_id: None,
        })
        .await
        .unwrap()
        .data;
    let StockStatus::Product(product) = status else {
        panic!("expected a product-wide status");
    };
    assert_eq!(product.total_on_hand, 50);
    assert_eq!(product.location_count, 2);
}

#[tokio::test]
async fn receipt_then_pick_restores_quantity() {
    let service = service();
    service.create_transaction(create("widget", "A1", "RECEIPT", 15)).await.unwrap();

    service.create_transaction(create("widget", "A1", "RECEIPT", 100)).await.unwrap();
    service.create_transaction(create("widget", "A1", "PICK", 100)).await.unwrap();
    assert_eq!(on_hand(&service, "widget", "A1").await, 15);
}

#[tokio::test]
async fn cancelling_twice_is_an_invalid_state() {
    let service = service();
    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap().data;
    service.cancel_transaction(cancel(receipt.id)).await.unwrap();

    let err = service.cancel_transaction(cancel(receipt.id)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(on_hand(&service, "widget", "A1").await, 0);
    assert_eq!(service.get_transaction_history(None).await.unwrap().data.len(), 2);
}

#[tokio::test]
async fn reversed_transactions_cannot_be_updated() {
    let service = service();
    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap().data;
    service.cancel_transaction(cancel(receipt.id)).await.unwrap();

    let err = service
        .update_transaction(UpdateTransactionRequest {
            transaction_id: receipt.id.to_string(),
            quantity: Some(10),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_picks_never_overdraw() {
    const STOCK: i64 = 100;
    const PICK: i64 = 7;
    const WORKERS: usize = 32;

    let service = Arc::new(service());
    service.create_transaction(create("widget", "A1", "RECEIPT", STOCK)).await.unwrap();

    let mut handles = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.create_transaction(create("widget", "A1", "PICK", PICK)).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert_eq!(e.kind, ErrorKind::InsufficientStock, "{e}"),
        }
    }

    assert_eq!(successes, STOCK / PICK);
    assert_eq!(on_hand(&service, "widget", "A1").await, STOCK - successes * PICK);
}

#[tokio::test]
async fn reads_after_a_mutation_see_the_commit() {
    let tier = Arc::new(InMemoryTtlStore::new());
    let engine = engine(InMemoryLedgerStore::new())
        .with_stock_cache(TieredCache::new("stock", Duration::from_secs(300)).with_distributed(tier.clone()));
    let service = wrap(engine);

    assert_eq!(on_hand(&service, "widget", "A1").await, 0);
    assert!(!tier.is_empty());

    service.create_transaction(create("widget", "A1", "RECEIPT", 12)).await.unwrap();
    assert_eq!(on_hand(&service, "widget", "A1").await, 12);

    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 3)).await.unwrap().data;
    service
        .update_transaction(UpdateTransactionRequest {
            transaction_id: receipt.id.to_string(),
            quantity: Some(8),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(on_hand(&service, "widget", "A1").await, 20);

    service.cancel_transaction(cancel(receipt.id)).await.unwrap();
    assert_eq!(on_hand(&service, "widget", "A1").await, 12);
}

#[tokio::test]
async fn exhausted_retries_leave_a_failed_audit_entry() {
    let service = service();
    service.create_transaction(create("widget", "A1", "RECEIPT", 10)).await.unwrap();
    service.engine().store().fail_next(4, Fault::Transient);

    let err = service.create_transaction(create("widget", "A1", "PICK", 4)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::PersistentFailure);
    assert_eq!(on_hand(&service, "widget", "A1").await, 10);

    let history = service.get_transaction_history(None).await.unwrap().data;
    let failed: Vec<_> = history.iter().filter(|t| t.state == TransactionState::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].quantity_before, 10);
    assert!(history.iter().all(|t| t.state != TransactionState::Processing));
}

#[tokio::test]
async fn transient_failures_within_budget_succeed() {
    let service = service();
    service.engine().store().fail_next(2, Fault::Transient);

    let tx = service.create_transaction(create("widget", "A1", "RECEIPT", 10)).await.unwrap().data;
    assert_eq!(tx.quantity_after, 10);
    assert_eq!(service.get_transaction_history(None).await.unwrap().data.len(), 1);
}

#[tokio::test]
async fn failed_update_rolls_back() {
    let service = service();
    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 40)).await.unwrap().data;
    service.engine().store().fail_next(1, Fault::Permanent);

    let err = service
        .update_transaction(UpdateTransactionRequest {
            transaction_id: receipt.id.to_string(),
            quantity: Some(5),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PersistentFailure);

    let stored = service.get_transaction(&receipt.id.to_string()).await.unwrap().data;
    assert_eq!(stored.state, TransactionState::Completed);
    assert_eq!(stored.quantity, 40);
    assert_eq!(on_hand(&service, "widget", "A1").await, 40);
}

#[tokio::test]
async fn pool_exhaustion_is_reported_not_retried() {
    let store = InMemoryLedgerStore::with_pool(1, Duration::from_millis(50));
    store.set_latency(Some(Duration::from_millis(300)));
    let service = wrap(engine(store));

    let (a, b) = tokio::join!(
        on_hand_result(&service, "A1"),
        on_hand_result(&service, "B2"),
    );
    let kinds: Vec<_> = [a, b].into_iter().filter_map(Result::err).collect();
    assert_eq!(kinds, vec![ErrorKind::PoolExhausted]);
}

async fn on_hand_result(service: &Service, location: &str) -> Result<i64, ErrorKind> {
    service
        .get_stock_status(StockStatusRequest {
            product_id: "widget".to_string(),
            location_id: Some(location.to_string()),
        })
        .await
        .map(|r| r.data.on_hand())
        .map_err(|e| e.kind)
}

#[tokio::test]
async fn unknown_ids_follow_the_configured_policy() {
    let strict = service();
    let unknown = stockledger_core::TransactionId::new();
    let err = strict.cancel_transaction(cancel(unknown)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    let permissive = wrap(engine(InMemoryLedgerStore::new()).with_options(EngineOptions {
        missing_transaction: MissingTransaction::Fabricate,
        ..EngineOptions::default()
    }));
    let updated = permissive
        .update_transaction(UpdateTransactionRequest {
            transaction_id: unknown.to_string(),
            quantity: Some(3),
            operator_id: Some("op-9".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .data;
    assert_eq!(updated.id, unknown);
    assert_eq!(updated.state, TransactionState::Updated);
    assert_eq!(updated.product_id, SYNTHETIC_PLACEHOLDER);
    assert!(permissive.get_transaction_history(None).await.unwrap().data.is_empty());
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let service = service();

    for req in [
        create("widget", "A1", "TRANSFER", 5),
        create("widget", "A1", "RECEIPT", 0),
        create(" ", "A1", "RECEIPT", 5),
    ] {
        let err = service.create_transaction(req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError, "{err}");
    }

    let err = service.cancel_transaction(cancel("TXN_123")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValidationError);
    assert!(service.get_transaction_history(None).await.unwrap().data.is_empty());
}

#[tokio::test]
async fn history_is_newest_first_and_clamped() {
    let service = service();
    for qty in 1..=5 {
        service.create_transaction(create("widget", "A1", "RECEIPT", qty)).await.unwrap();
    }

    let all = service.get_transaction_history(None).await.unwrap().data;
    assert_eq!(all.len(), 5);
    assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    assert_eq!(service.get_transaction_history(Some(0)).await.unwrap().data.len(), 1);
    assert_eq!(service.get_transaction_history(Some(2)).await.unwrap().data.len(), 2);
}

#[tokio::test]
async fn health_reflects_collaborators() {
    let service = service();
    assert_eq!(service.health_check().await.data.status, HealthStatus::Healthy);

    service.engine().store().set_unreachable(true);
    let report = service.health_check().await.data;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.store.error.is_some());

    let tier = Arc::new(InMemoryTtlStore::new());
    tier.set_unavailable(true);
    let degraded = wrap(
        engine(InMemoryLedgerStore::new())
            .with_stock_cache(TieredCache::new("stock", Duration::from_secs(30)).with_distributed(tier)),
    );
    assert_eq!(degraded.health_check().await.data.status, HealthStatus::Degraded);
    // Reads still work off the local tier and the store.
    assert_eq!(on_hand(&degraded, "widget", "A1").await, 0);
}

#[tokio::test]
async fn metrics_summarise_recent_operations() {
    let service = service();
    service.create_transaction(create("widget", "A1", "RECEIPT", 5)).await.unwrap();
    service.create_transaction(create("widget", "A1", "PICK", 50)).await.unwrap_err();
    on_hand(&service, "widget", "A1").await;

    let snapshot = service.get_metrics(None);
    assert_eq!(snapshot.total_operations, 3);
    let create_summary = &snapshot.operations["create_transaction"];
    assert_eq!(create_summary.count, 2);
    assert_eq!(create_summary.success_rate_percent, 50.0);
    assert_eq!(snapshot.operations["get_stock_status"].count, 1);
    assert_eq!(snapshot.latency_budget_ms, 500);

    assert_eq!(service.get_metrics(Some(1)).recent.len(), 1);
}

#[tokio::test]
async fn descriptors_are_derived_once_and_cached() {
    let service = service();
    let first = service.get_product_descriptor("zapatos").await.unwrap().data;
    let second = service.get_product_descriptor("zapatos").await.unwrap().data;
    assert_eq!(first, second);
    assert_eq!(first.code, "Z");

    let err = service.get_product_descriptor("  ").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValidationError);
}

fn subscribe(engine: Engine) -> (Service, Subscription<EventEnvelope<JsonValue>>) {
    let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
    let sub = bus.subscribe();
    (wrap(engine.with_publisher(EventPublisher::new().with_sink(bus))), sub)
}

#[tokio::test]
async fn commits_are_announced_after_the_fact() {
    let (service, sub) = subscribe(engine(InMemoryLedgerStore::new()));
    let receipt = service.create_transaction(create("widget", "A1", "RECEIPT", 50)).await.unwrap().data;
    service.cancel_transaction(cancel(receipt.id)).await.unwrap();

    let mut types: Vec<String> = (0..4)
        .map(|_| sub.recv_timeout(Duration::from_secs(2)).unwrap())
        .map(|e| e.event_type().to_string())
        .collect();
    types.sort();
    assert_eq!(
        types,
        vec![
            "inventory.stock.low",
            "inventory.transaction.completed",
            "inventory.transaction.completed",
            "inventory.transaction.reversed",
        ]
    );
}
