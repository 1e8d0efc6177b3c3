//! The order service.
//!
//! Request-path entry points for the order context: create an order
//! (validation + duplicate-window rejection + `OrderCreated`), cancel it
//! (state machine + 24-hour window + `OrderCancelled` with compensations),
//! progress it through fulfilment, and run the refund pathway.
//!
//! Orders are mutated only through the aggregate's state machine and
//! persisted with an optimistic version check; a lost check is retried
//! locally before surfacing as a conflict.

use crate::payment::PaymentAdapter;
use crate::OrdersError;
use chrono::{DateTime, Utc};
use ordermesh_core::config::OrderConfig;
use ordermesh_core::events::{CompensationAction, EventPayload, OrderCancelled, OrderCreated, OrderCreatedItem};
use ordermesh_core::ids::{CorrelationId, CustomerId, OrderId, ProductId};
use ordermesh_core::money::Money;
use ordermesh_core::order::{ActorType, CancellationReason, Order, OrderError, OrderItem};
use ordermesh_core::ports::{Clock, OrderRepository};
use ordermesh_core::quantity::Quantity;
use ordermesh_core::EventEnvelope;
use ordermesh_runtime::publisher::ReliablePublisher;
use ordermesh_runtime::retry::{retry_classified, RetryPolicy};
use std::sync::Arc;

/// The service name stamped on published envelopes.
pub const SOURCE_SERVICE: &str = "order-service";

/// One requested order line, before validation.
#[derive(Clone, Debug)]
pub struct NewOrderItem {
    /// The product to order.
    pub product_id: ProductId,
    /// Display name captured at request time.
    pub product_name: String,
    /// Units requested.
    pub quantity: Quantity,
    /// Price per unit.
    pub unit_price: Money,
}

/// The order context's application service.
pub struct OrderService {
    orders: Arc<dyn OrderRepository>,
    publisher: Arc<ReliablePublisher>,
    payments: Arc<PaymentAdapter>,
    clock: Arc<dyn Clock>,
    config: OrderConfig,
    conflict_retry: RetryPolicy,
}

impl OrderService {
    /// Wire the service to its process-level resources.
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        publisher: Arc<ReliablePublisher>,
        payments: Arc<PaymentAdapter>,
        clock: Arc<dyn Clock>,
        config: OrderConfig,
    ) -> Self {
        Self {
            orders,
            publisher,
            payments,
            clock,
            config,
            conflict_retry: RetryPolicy::default(),
        }
    }

    /// Override the conflict retry policy (tests use tight delays).
    #[must_use]
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    /// Accept a new order: validate the lines, reject identical
    /// re-submissions inside the duplicate window, persist in `PENDING`,
    /// and publish `OrderCreated` to start the saga.
    ///
    /// # Errors
    ///
    /// Item validation errors, [`OrderError::DuplicateOrder`], or the
    /// repository failure.
    pub async fn create_order(
        &self,
        customer_id: CustomerId,
        items: Vec<NewOrderItem>,
    ) -> Result<Order, OrdersError> {
        let now = self.clock.now();

        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            lines.push(OrderItem::new(
                item.product_id,
                item.product_name,
                item.quantity,
                item.unit_price,
            )?);
        }

        let content_hash = Order::compute_content_hash(customer_id, &lines);
        let window_start = now - self.config.duplicate_window();
        if let Some(existing) = self
            .orders
            .find_duplicate(customer_id, content_hash, window_start)
            .await?
        {
            metrics::counter!("orders.duplicate_rejected").increment(1);
            return Err(OrdersError::Order(OrderError::DuplicateOrder { existing }));
        }

        let order = Order::create(OrderId::new(), customer_id, lines, now)?;
        self.orders.insert(&order).await?;

        let created = OrderCreated {
            order_id: order.order_id(),
            customer_id,
            items: order
                .items()
                .iter()
                .map(|item| OrderCreatedItem {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price.minor_units(),
                    currency: item.unit_price.currency(),
                })
                .collect(),
            total_amount: order.total_amount(),
            created_at: order.created_at(),
        };
        self.publish(
            EventPayload::OrderCreated(created),
            &order,
            CorrelationId::new(),
        )
        .await;

        tracing::info!(
            order_id = %order.order_id(),
            customer_id = %customer_id,
            total = %order.total_amount(),
            "Order created"
        );
        metrics::counter!("orders.created").increment(1);
        Ok(order)
    }

    /// Cancel an order, publishing `OrderCancelled` with the stock-restore
    /// compensation. Customer cancellations respect the 24-hour window
    /// after payment; repeated cancellation of a cancelled order is a
    /// no-op success.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`],
    /// [`OrderError::CancellationWindowExpired`], or a repository failure.
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
        cancelled_by: impl Into<String>,
        cancelled_by_type: ActorType,
        correlation_id: CorrelationId,
    ) -> Result<Order, OrdersError> {
        let cancellation = CancellationReason {
            reason: reason.into(),
            cancelled_by: cancelled_by.into(),
            cancelled_by_type,
        };
        let cancellation_for_mutate = cancellation.clone();

        let (order, changed) = self
            .mutate(order_id, move |order, now| {
                order.cancel(cancellation_for_mutate.clone(), now)
            })
            .await?;

        if changed {
            let event = OrderCancelled {
                order_id,
                cancel_reason: cancellation.reason.clone(),
                cancel_reason_code: match cancellation.cancelled_by_type {
                    ActorType::Customer => "CUSTOMER_REQUEST".to_string(),
                    ActorType::System => "SYSTEM_COMPENSATION".to_string(),
                },
                cancelled_by: cancellation.cancelled_by.clone(),
                cancelled_by_type: cancellation.cancelled_by_type,
                compensation_actions: vec![CompensationAction::stock_restore(order_id)],
            };
            self.publish(EventPayload::OrderCancelled(event), &order, correlation_id)
                .await;
            metrics::counter!("orders.cancelled").increment(1);
        }
        Ok(order)
    }

    /// `PAID → PREPARING`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] or a repository failure.
    pub async fn start_preparing(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        let (order, _) = self.mutate(order_id, Order::start_preparing).await?;
        Ok(order)
    }

    /// `PREPARING → SHIPPED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] or a repository failure.
    pub async fn ship(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        let (order, _) = self.mutate(order_id, Order::ship).await?;
        Ok(order)
    }

    /// `SHIPPED → DELIVERED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] or a repository failure.
    pub async fn deliver(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        let (order, _) = self.mutate(order_id, Order::deliver).await?;
        Ok(order)
    }

    /// `DELIVERED → COMPLETED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] or a repository failure.
    pub async fn complete(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        let (order, _) = self.mutate(order_id, Order::complete).await?;
        Ok(order)
    }

    /// Run the refund pathway: transition to `REFUNDING`, refund the
    /// payment at the gateway, then settle to `REFUNDED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] when the order is not refundable,
    /// the gateway failure, or a repository failure.
    pub async fn refund_order(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        let (order, _) = self.mutate(order_id, Order::refund).await?;

        if let Some(payment_id) = order.payment_id() {
            self.payments
                .refund(payment_id, order.total_amount())
                .await?;
        }

        let (order, changed) = self.mutate(order_id, Order::complete_refund).await?;
        if changed {
            tracing::info!(order_id = %order_id, "Order refunded");
            metrics::counter!("orders.refunded").increment(1);
        }
        Ok(order)
    }

    /// Load an order (cancelled orders remain queryable).
    ///
    /// # Errors
    ///
    /// The repository failure.
    pub async fn order(&self, order_id: OrderId) -> Result<Order, OrdersError> {
        Ok(self.orders.load(order_id).await?)
    }

    /// Load-mutate-save with bounded conflict retry. Returns the saved
    /// order and whether the mutation changed anything (idempotent no-op
    /// repeats do not bump the version and publish nothing).
    pub(crate) async fn mutate<F>(
        &self,
        order_id: OrderId,
        transition: F,
    ) -> Result<(Order, bool), OrdersError>
    where
        F: Fn(&mut Order, DateTime<Utc>) -> Result<(), OrderError>,
    {
        retry_classified(&self.conflict_retry, || async {
            let mut order = self.orders.load(order_id).await?;
            let expected = order.version();
            let now = self.clock.now();

            transition(&mut order, now).map_err(OrdersError::Order)?;
            let changed = order.version() != expected;

            if changed {
                self.orders.save(&order, expected).await?;
            }
            Ok::<_, OrdersError>((order, changed))
        })
        .await
    }

    pub(crate) async fn publish(
        &self,
        payload: EventPayload,
        order: &Order,
        correlation_id: CorrelationId,
    ) {
        let envelope = EventEnvelope::new(
            payload,
            order.version(),
            correlation_id,
            SOURCE_SERVICE,
            self.clock.now(),
        );
        if let Err(e) = self.publisher.publish(&envelope).await {
            tracing::error!(
                event_type = envelope.event_type(),
                aggregate_id = envelope.aggregate_id(),
                error = %e,
                "Post-commit publish failed (dead-lettered)"
            );
        }
    }
}
