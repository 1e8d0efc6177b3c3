//! Stock service behaviour over in-memory ports: the reservation laws,
//! batch atomicity, and the low-stock signal.

#![allow(clippy::expect_used, clippy::unwrap_used)] // Test code

use ordermesh_core::config::ReservationConfig;
use ordermesh_core::ids::{CorrelationId, OrderId, ProductId};
use ordermesh_core::order::ActorType;
use ordermesh_core::ports::{Clock, DeadLetterSink, EventPublisher, ProductRepository};
use ordermesh_core::product::{Product, ReleaseReason, ReservationState};
use ordermesh_core::quantity::Quantity;
use ordermesh_core::Classify;
use ordermesh_inventory::{InventoryError, ReserveLine, StockService};
use ordermesh_runtime::cache::Cache;
use ordermesh_runtime::lock::InProcessLockStore;
use ordermesh_runtime::publisher::ReliablePublisher;
use ordermesh_runtime::retry::RetryPolicy;
use ordermesh_runtime::{InvalidationBus, LockService};
use ordermesh_testing::{
    test_clock, InMemoryDeadLetterSink, InMemoryEventBus, InMemoryProductRepository,
};
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    bus: Arc<InMemoryEventBus>,
    products: Arc<InMemoryProductRepository>,
    service: StockService,
}

fn tight_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(2))
        .jitter(false)
        .build()
}

fn setup() -> Setup {
    let bus = Arc::new(InMemoryEventBus::new());
    let products = Arc::new(InMemoryProductRepository::new());
    let clock: Arc<dyn Clock> = Arc::new(test_clock());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    let publisher = Arc::new(
        ReliablePublisher::new(
            Arc::clone(&bus) as Arc<dyn EventPublisher>,
            dead_letters as Arc<dyn DeadLetterSink>,
            Arc::clone(&clock),
        )
        .with_policy(tight_retry()),
    );

    let service = StockService::new(
        Arc::clone(&products) as Arc<dyn ProductRepository>,
        LockService::new(
            Arc::new(InProcessLockStore::new()),
            Duration::from_secs(3),
            Duration::from_secs(10),
        ),
        publisher,
        clock,
        Arc::new(Cache::new("product", Duration::from_secs(600))),
        Arc::new(Cache::new("stock", Duration::from_secs(300))),
        Arc::new(InvalidationBus::default()),
        ReservationConfig::default(),
    )
    .with_conflict_retry(tight_retry());

    Setup {
        bus,
        products,
        service,
    }
}

fn seed(setup: &Setup, total: u64, threshold: u64) -> ProductId {
    let product = Product::new(
        ProductId::new(),
        "Widget",
        Quantity::new(total),
        Quantity::new(threshold),
    );
    let id = product.product_id();
    setup.products.seed(product);
    id
}

#[tokio::test]
async fn reserve_then_release_restores_the_ledger() {
    let s = setup();
    let product_id = seed(&s, 50, 0);
    let before = s.products.get(product_id).unwrap().stock();

    let reservation = s
        .service
        .reserve(product_id, OrderId::new(), Quantity::new(7), CorrelationId::new())
        .await
        .expect("reserve succeeds");

    let held = s.products.get(product_id).unwrap().stock();
    assert_eq!(held.available, Quantity::new(43));
    assert_eq!(held.reserved, Quantity::new(7));
    assert_eq!(held.total, Quantity::new(50));

    s.service
        .release(
            product_id,
            reservation.reservation_id,
            ReleaseReason::OrderCancelled,
            "test",
            ActorType::System,
            CorrelationId::new(),
        )
        .await
        .expect("release succeeds");

    assert_eq!(s.products.get(product_id).unwrap().stock(), before);
    assert_eq!(s.bus.published_of_type("StockReserved.v1").len(), 1);
    assert_eq!(s.bus.published_of_type("StockReleased.v1").len(), 1);
}

#[tokio::test]
async fn confirm_deducts_but_leaves_available_alone() {
    let s = setup();
    let product_id = seed(&s, 50, 0);

    let reservation = s
        .service
        .reserve(product_id, OrderId::new(), Quantity::new(7), CorrelationId::new())
        .await
        .expect("reserve succeeds");
    let available_before_confirm = s.products.get(product_id).unwrap().stock().available;

    s.service
        .confirm(product_id, reservation.reservation_id, CorrelationId::new())
        .await
        .expect("confirm succeeds");

    let stock = s.products.get(product_id).unwrap().stock();
    assert_eq!(stock.available, available_before_confirm, "available unchanged");
    assert_eq!(stock.total, Quantity::new(43));
    assert_eq!(stock.reserved, Quantity::ZERO);
    assert_eq!(s.bus.published_of_type("StockDeducted.v1").len(), 1);
}

#[tokio::test]
async fn repeated_confirm_publishes_one_deduction() {
    let s = setup();
    let product_id = seed(&s, 50, 0);

    let reservation = s
        .service
        .reserve(product_id, OrderId::new(), Quantity::new(3), CorrelationId::new())
        .await
        .expect("reserve succeeds");

    for _ in 0..3 {
        s.service
            .confirm(product_id, reservation.reservation_id, CorrelationId::new())
            .await
            .expect("confirm is idempotent");
    }

    assert_eq!(s.products.get(product_id).unwrap().stock().total, Quantity::new(47));
    assert_eq!(s.bus.published_of_type("StockDeducted.v1").len(), 1);
}

#[tokio::test]
async fn batch_reserve_is_all_or_nothing() {
    let s = setup();
    let plenty = seed(&s, 100, 0);
    let scarce = seed(&s, 1, 0);
    let order_id = OrderId::new();

    let result = s
        .service
        .reserve_batch(
            &[
                ReserveLine {
                    product_id: plenty,
                    quantity: Quantity::new(5),
                },
                ReserveLine {
                    product_id: scarce,
                    quantity: Quantity::new(3),
                },
            ],
            order_id,
            CorrelationId::new(),
        )
        .await;

    assert!(result.is_err(), "one short line fails the whole batch");

    // Whatever was taken for the first line has been handed back.
    let plenty_stock = s.products.get(plenty).unwrap().stock();
    assert_eq!(plenty_stock.available, Quantity::new(100));
    assert_eq!(plenty_stock.reserved, Quantity::ZERO);
    let scarce_stock = s.products.get(scarce).unwrap().stock();
    assert_eq!(scarce_stock.available, Quantity::new(1));

    // No reservation event escaped the aborted batch.
    assert!(s.bus.published_of_type("StockReserved.v1").is_empty());
}

#[tokio::test]
async fn batch_reserve_succeeds_across_products() {
    let s = setup();
    let first = seed(&s, 10, 0);
    let second = seed(&s, 10, 0);
    let order_id = OrderId::new();

    let reservations = s
        .service
        .reserve_batch(
            &[
                ReserveLine {
                    product_id: first,
                    quantity: Quantity::new(2),
                },
                ReserveLine {
                    product_id: second,
                    quantity: Quantity::new(4),
                },
            ],
            order_id,
            CorrelationId::new(),
        )
        .await
        .expect("batch succeeds");

    assert_eq!(reservations.len(), 2);
    assert_eq!(s.products.get(first).unwrap().stock().reserved, Quantity::new(2));
    assert_eq!(s.products.get(second).unwrap().stock().reserved, Quantity::new(4));
    assert_eq!(s.bus.published_of_type("StockReserved.v1").len(), 2);
}

#[tokio::test]
async fn low_stock_crossing_emits_an_alert() {
    let s = setup();
    let product_id = seed(&s, 10, 4);

    // 10 -> 7 available: above threshold, no alert.
    s.service
        .reserve(product_id, OrderId::new(), Quantity::new(3), CorrelationId::new())
        .await
        .expect("reserve succeeds");
    assert!(s.bus.published_of_type("LowStockAlert.v1").is_empty());

    // 7 -> 3 available: at or below threshold, alert fires.
    s.service
        .reserve(product_id, OrderId::new(), Quantity::new(4), CorrelationId::new())
        .await
        .expect("reserve succeeds");
    let alerts = s.bus.published_of_type("LowStockAlert.v1");
    assert_eq!(alerts.len(), 1);
}

#[tokio::test]
async fn zero_quantity_reserve_is_rejected_as_validation() {
    let s = setup();
    let product_id = seed(&s, 10, 0);

    let result = s
        .service
        .reserve(product_id, OrderId::new(), Quantity::ZERO, CorrelationId::new())
        .await;

    let err = result.expect_err("zero quantity rejected");
    assert_eq!(err.class(), ordermesh_core::ErrorClass::Validation);
}

#[tokio::test]
async fn unknown_product_surfaces_not_found() {
    let s = setup();
    let result = s
        .service
        .reserve(ProductId::new(), OrderId::new(), Quantity::new(1), CorrelationId::new())
        .await;

    assert!(matches!(
        result,
        Err(InventoryError::Repository(
            ordermesh_core::ports::RepositoryError::NotFound(_)
        ))
    ));
}

#[tokio::test]
async fn adjust_cannot_consume_reserved_stock() {
    let s = setup();
    let product_id = seed(&s, 10, 0);

    s.service
        .reserve(product_id, OrderId::new(), Quantity::new(8), CorrelationId::new())
        .await
        .expect("reserve succeeds");

    let result = s
        .service
        .adjust(product_id, -5, "shrinkage", CorrelationId::new())
        .await;
    assert!(result.is_err(), "only 2 units are adjustable");

    let stock = s.products.get(product_id).unwrap().stock();
    assert_eq!(stock.reserved, Quantity::new(8));
    assert_eq!(stock.total, Quantity::new(10));
}

#[tokio::test]
async fn cached_stock_read_tracks_writes() {
    let s = setup();
    let product_id = seed(&s, 10, 0);

    // First read populates the cache from the store.
    let levels = s.service.stock_levels(product_id).await.expect("read");
    assert_eq!(levels.available, Quantity::new(10));

    // A mutation writes through, so the next cached read is current.
    s.service
        .reserve(product_id, OrderId::new(), Quantity::new(4), CorrelationId::new())
        .await
        .expect("reserve succeeds");
    let levels = s.service.stock_levels(product_id).await.expect("read");
    assert_eq!(levels.available, Quantity::new(6));
    assert_eq!(levels.reserved, Quantity::new(4));
}
