//! In-memory implementations of the core ports.
//!
//! These back the unit and end-to-end scenario tests: deterministic clocks,
//! a synchronous event bus with published-event inspection, version-checked
//! repositories, a processed-event log, a dead-letter sink, and a
//! scriptable payment gateway.

use chrono::{DateTime, Duration, Utc};
use ordermesh_core::envelope::EventEnvelope;
use ordermesh_core::ids::{CustomerId, EventId, OrderId, PaymentId, ProductId};
use ordermesh_core::money::Money;
use ordermesh_core::order::Order;
use ordermesh_core::ports::{
    Clock, DeadLetter, DeadLetterError, DeadLetterSink, EnvelopeStream, EventBusError,
    EventPublisher, EventSubscriber, OrderRepository, PaymentError, PaymentGateway,
    PaymentOutcome, PaymentRequest, PortFuture, ProcessedEventLog, ProcessedLogError,
    ProductRepository, RepositoryError,
};
use ordermesh_core::product::Product;
use ordermesh_core::version::Version;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Fixed clock: always returns the same instant.
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a clock pinned to `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A clock that tests advance by hand (reservation-expiry scenarios).
#[derive(Debug, Clone, Default)]
pub struct SteppingClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl SteppingClock {
    /// Create a stepping clock starting at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut time = lock(&self.time);
        *time += by;
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut time = lock(&self.time);
        *time = to;
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.time)
    }
}

/// The default test instant (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Never in practice; the hardcoded timestamp always parses.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_instant() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .expect("hardcoded timestamp should always parse")
        .with_timezone(&Utc)
}

/// A [`FixedClock`] at [`test_instant`].
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(test_instant())
}

/// In-memory event bus: publishing records the envelope and fans it out to
/// subscribers; tests inspect everything that was published.
pub struct InMemoryEventBus {
    published: Mutex<Vec<EventEnvelope>>,
    sender: broadcast::Sender<EventEnvelope>,
    /// When set, publishes fail with this reason (for retry/DLQ tests).
    fail_publishes: Mutex<Option<String>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            published: Mutex::new(Vec::new()),
            sender,
            fail_publishes: Mutex::new(None),
        }
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<EventEnvelope> {
        lock(&self.published).clone()
    }

    /// Published envelopes with the given type tag.
    #[must_use]
    pub fn published_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        lock(&self.published)
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Make every subsequent publish fail (until [`Self::heal`]).
    pub fn break_publishing(&self, reason: impl Into<String>) {
        *lock(&self.fail_publishes) = Some(reason.into());
    }

    /// Let publishes succeed again.
    pub fn heal(&self) {
        *lock(&self.fail_publishes) = None;
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish(&self, envelope: &EventEnvelope) -> PortFuture<'_, Result<(), EventBusError>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            if let Some(reason) = lock(&self.fail_publishes).clone() {
                return Err(EventBusError::PublishFailed {
                    topic: envelope.topic().to_string(),
                    reason,
                });
            }
            lock(&self.published).push(envelope.clone());
            // No subscribers is fine; published() still records.
            let _ = self.sender.send(envelope);
            Ok(())
        })
    }
}

impl EventSubscriber for InMemoryEventBus {
    fn subscribe(&self, topics: &[&str]) -> PortFuture<'_, Result<EnvelopeStream, EventBusError>> {
        let topics: HashSet<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let mut receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(envelope) => {
                            if topics.contains(envelope.topic()) {
                                yield Ok(envelope);
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            yield Err(EventBusError::TransportError(format!(
                                "subscriber lagged by {missed} events"
                            )));
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as EnvelopeStream)
        })
    }
}

/// In-memory product repository with optimistic version checking.
#[derive(Default)]
pub struct InMemoryProductRepository {
    products: Mutex<HashMap<ProductId, Product>>,
}

impl InMemoryProductRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a product, bypassing version checks (test setup).
    pub fn seed(&self, product: Product) {
        lock(&self.products).insert(product.product_id(), product);
    }

    /// Read a product without going through the port (test assertions).
    #[must_use]
    pub fn get(&self, product_id: ProductId) -> Option<Product> {
        lock(&self.products).get(&product_id).cloned()
    }
}

impl ProductRepository for InMemoryProductRepository {
    fn load(&self, product_id: ProductId) -> PortFuture<'_, Result<Product, RepositoryError>> {
        Box::pin(async move {
            lock(&self.products)
                .get(&product_id)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound(format!("product {product_id}")))
        })
    }

    fn insert(&self, product: &Product) -> PortFuture<'_, Result<(), RepositoryError>> {
        let product = product.clone();
        Box::pin(async move {
            let mut products = lock(&self.products);
            if products.contains_key(&product.product_id()) {
                return Err(RepositoryError::Storage(format!(
                    "product {} already exists",
                    product.product_id()
                )));
            }
            products.insert(product.product_id(), product);
            Ok(())
        })
    }

    fn save(
        &self,
        product: &Product,
        expected: Version,
    ) -> PortFuture<'_, Result<(), RepositoryError>> {
        let product = product.clone();
        Box::pin(async move {
            let mut products = lock(&self.products);
            let stored = products
                .get(&product.product_id())
                .ok_or_else(|| RepositoryError::NotFound(format!("product {}", product.product_id())))?;
            if stored.version() != expected {
                return Err(RepositoryError::ConcurrencyConflict {
                    expected,
                    actual: stored.version(),
                });
            }
            products.insert(product.product_id(), product);
            Ok(())
        })
    }

    fn products_with_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>> {
        Box::pin(async move {
            Ok(lock(&self.products)
                .values()
                .filter(|p| p.reservations().any(|r| r.is_expired(now)))
                .map(Product::product_id)
                .collect())
        })
    }

    fn products_with_reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>> {
        Box::pin(async move {
            Ok(lock(&self.products)
                .values()
                .filter(|p| p.reservations().any(|r| r.order_id == order_id))
                .map(Product::product_id)
                .collect())
        })
    }
}

/// In-memory order repository with optimistic version checking and the
/// duplicate-window query.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: Mutex<HashMap<OrderId, Order>>,
}

impl InMemoryOrderRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an order without going through the port (test assertions).
    #[must_use]
    pub fn get(&self, order_id: OrderId) -> Option<Order> {
        lock(&self.orders).get(&order_id).cloned()
    }

    /// All stored orders (test assertions).
    #[must_use]
    pub fn all(&self) -> Vec<Order> {
        lock(&self.orders).values().cloned().collect()
    }
}

impl OrderRepository for InMemoryOrderRepository {
    fn load(&self, order_id: OrderId) -> PortFuture<'_, Result<Order, RepositoryError>> {
        Box::pin(async move {
            lock(&self.orders)
                .get(&order_id)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound(format!("order {order_id}")))
        })
    }

    fn insert(&self, order: &Order) -> PortFuture<'_, Result<(), RepositoryError>> {
        let order = order.clone();
        Box::pin(async move {
            let mut orders = lock(&self.orders);
            if orders.contains_key(&order.order_id()) {
                return Err(RepositoryError::Storage(format!(
                    "order {} already exists",
                    order.order_id()
                )));
            }
            orders.insert(order.order_id(), order);
            Ok(())
        })
    }

    fn save(&self, order: &Order, expected: Version) -> PortFuture<'_, Result<(), RepositoryError>> {
        let order = order.clone();
        Box::pin(async move {
            let mut orders = lock(&self.orders);
            let stored = orders
                .get(&order.order_id())
                .ok_or_else(|| RepositoryError::NotFound(format!("order {}", order.order_id())))?;
            if stored.version() != expected {
                return Err(RepositoryError::ConcurrencyConflict {
                    expected,
                    actual: stored.version(),
                });
            }
            orders.insert(order.order_id(), order);
            Ok(())
        })
    }

    fn find_duplicate(
        &self,
        customer_id: CustomerId,
        content_hash: u64,
        window_start: DateTime<Utc>,
    ) -> PortFuture<'_, Result<Option<OrderId>, RepositoryError>> {
        Box::pin(async move {
            Ok(lock(&self.orders)
                .values()
                .filter(|o| {
                    o.customer_id() == customer_id
                        && o.content_hash() == content_hash
                        && !o.status().is_terminal()
                        && o.created_at() >= window_start
                })
                .max_by_key(|o| o.created_at())
                .map(Order::order_id))
        })
    }
}

/// In-memory processed-event log.
#[derive(Default)]
pub struct InMemoryProcessedEventLog {
    seen: Mutex<HashSet<(String, EventId)>>,
}

impl InMemoryProcessedEventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events across all consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessedEventLog for InMemoryProcessedEventLog {
    fn already_processed(
        &self,
        consumer: &str,
        event_id: EventId,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
        let key = (consumer.to_string(), event_id);
        Box::pin(async move { Ok(lock(&self.seen).contains(&key)) })
    }

    fn mark_if_new(
        &self,
        consumer: &str,
        event_id: EventId,
        _aggregate_id: &str,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
        let key = (consumer.to_string(), event_id);
        Box::pin(async move { Ok(lock(&self.seen).insert(key)) })
    }
}

/// In-memory dead-letter sink with inspection.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything dead-lettered so far.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        lock(&self.letters).clone()
    }

    /// Number of dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.letters).len()
    }

    /// Whether the sink is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn push(&self, letter: DeadLetter) -> PortFuture<'_, Result<(), DeadLetterError>> {
        Box::pin(async move {
            lock(&self.letters).push(letter);
            Ok(())
        })
    }
}

/// What the stub gateway should do on the next charge.
#[derive(Clone, Debug)]
pub enum ScriptedCharge {
    /// Approve with a fresh payment id.
    Approve,
    /// Decline with the given reason.
    Decline(String),
    /// Fail with a transport error.
    Unavailable(String),
}

/// Scriptable payment gateway. Unscripted charges approve.
#[derive(Default)]
pub struct StubPaymentGateway {
    script: Mutex<VecDeque<ScriptedCharge>>,
    charges: Mutex<Vec<PaymentRequest>>,
    refunds: Mutex<Vec<(PaymentId, Money)>>,
}

impl StubPaymentGateway {
    /// Create a gateway that approves everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted outcome for the next charge.
    pub fn script(&self, outcome: ScriptedCharge) {
        lock(&self.script).push_back(outcome);
    }

    /// Every charge request seen.
    #[must_use]
    pub fn charges(&self) -> Vec<PaymentRequest> {
        lock(&self.charges).clone()
    }

    /// Every refund issued.
    #[must_use]
    pub fn refunds(&self) -> Vec<(PaymentId, Money)> {
        lock(&self.refunds).clone()
    }
}

impl PaymentGateway for StubPaymentGateway {
    fn charge(
        &self,
        request: &PaymentRequest,
    ) -> PortFuture<'_, Result<PaymentOutcome, PaymentError>> {
        let request = request.clone();
        Box::pin(async move {
            lock(&self.charges).push(request.clone());
            match lock(&self.script).pop_front() {
                Some(ScriptedCharge::Decline(reason)) => Ok(PaymentOutcome::Declined { reason }),
                Some(ScriptedCharge::Unavailable(reason)) => {
                    Err(PaymentError::Unavailable(reason))
                },
                Some(ScriptedCharge::Approve) | None => Ok(PaymentOutcome::Approved {
                    payment_id: PaymentId::new(),
                    transaction_id: format!("txn-{}", request.order_id),
                }),
            }
        })
    }

    fn refund(
        &self,
        payment_id: PaymentId,
        amount: Money,
    ) -> PortFuture<'_, Result<(), PaymentError>> {
        Box::pin(async move {
            lock(&self.refunds).push((payment_id, amount));
            Ok(())
        })
    }
}
