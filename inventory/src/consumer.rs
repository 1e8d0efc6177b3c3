//! The inventory context's event consumer.
//!
//! Consumes order and payment events and drives the stock ledger:
//!
//! - `OrderCreated` → atomic batch reserve; on a business failure the
//!   consumer publishes `OrderFailed` so the order context can fail the
//!   order (the insufficient-stock compensation).
//! - `PaymentCompleted` → confirm every reservation held for the order,
//!   converting them to deductions.
//! - `PaymentFailed` → release every still-active reservation.
//! - `OrderCancelled` → apply `STOCK_RESTORE`: release active
//!   reservations and return already-deducted stock to the ledger.
//!
//! Handlers are idempotent: the dispatcher deduplicates deliveries on the
//! processed-event log, and every underlying stock operation is itself a
//! no-op when re-applied.

use crate::service::{ReserveLine, StockService, SOURCE_SERVICE};
use crate::InventoryError;
use ordermesh_core::events::{
    EventPayload, OrderCancelled, OrderCreated, OrderFailed, PaymentCompleted, PaymentFailed,
};
use ordermesh_core::ids::{CorrelationId, OrderId, ProductId};
use ordermesh_core::ports::{Clock, PortFuture, ProductRepository};
use ordermesh_core::product::{ReleaseReason, ReservationState};
use ordermesh_core::{Classify, ErrorClass, EventEnvelope, Version};
use ordermesh_runtime::dispatcher::{EventHandler, HandlerError};
use ordermesh_runtime::publisher::ReliablePublisher;
use std::sync::Arc;

/// The consumer-group name for the inventory side.
pub const CONSUMER_NAME: &str = "inventory-consumer";

/// Shared wiring for every inventory handler.
pub struct InventoryConsumer {
    service: Arc<StockService>,
    products: Arc<dyn ProductRepository>,
    publisher: Arc<ReliablePublisher>,
    clock: Arc<dyn Clock>,
}

impl InventoryConsumer {
    /// Wire the consumer to its resources.
    #[must_use]
    pub fn new(
        service: Arc<StockService>,
        products: Arc<dyn ProductRepository>,
        publisher: Arc<ReliablePublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            products,
            publisher,
            clock,
        }
    }

    /// The topics this consumer subscribes to.
    #[must_use]
    pub const fn topics() -> [&'static str; 4] {
        [
            "order-created",
            "payment-completed",
            "payment-failed",
            "order-cancelled",
        ]
    }

    /// Register every inventory handler on a dispatcher.
    #[must_use]
    pub fn register(self: &Arc<Self>, dispatcher: ordermesh_runtime::Dispatcher) -> ordermesh_runtime::Dispatcher {
        dispatcher
            .register(
                "OrderCreated.v1",
                Arc::new(OrderCreatedHandler {
                    consumer: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
            .register(
                "PaymentCompleted.v1",
                Arc::new(PaymentCompletedHandler {
                    consumer: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
            .register(
                "PaymentFailed.v1",
                Arc::new(PaymentFailedHandler {
                    consumer: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
            .register(
                "OrderCancelled.v1",
                Arc::new(OrderCancelledHandler {
                    consumer: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
    }

    async fn handle_order_created(
        &self,
        event: &OrderCreated,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let lines: Vec<ReserveLine> = event
            .items
            .iter()
            .map(|item| ReserveLine {
                product_id: item.product_id,
                quantity: item.quantity,
            })
            .collect();

        match self
            .service
            .reserve_batch(&lines, event.order_id, correlation_id)
            .await
        {
            Ok(reservations) => {
                tracing::info!(
                    order_id = %event.order_id,
                    reservations = reservations.len(),
                    "Stock reserved for order"
                );
                Ok(())
            },
            Err(err) if err.class().is_retryable() => Err(HandlerError::from_classified(&err)),
            Err(err) => {
                // A business failure here is the saga's insufficient-stock
                // branch: tell the order context, then treat the event as
                // handled.
                tracing::warn!(
                    order_id = %event.order_id,
                    error = %err,
                    "Reservation failed, failing the order"
                );
                self.publish_order_failed(event.order_id, &err, correlation_id)
                    .await;
                Ok(())
            },
        }
    }

    async fn publish_order_failed(
        &self,
        order_id: OrderId,
        err: &InventoryError,
        correlation_id: CorrelationId,
    ) {
        let failed = OrderFailed {
            order_id,
            reason: err.to_string(),
            failed_at: self.clock.now(),
        };
        let envelope = EventEnvelope::new(
            EventPayload::OrderFailed(failed),
            Version::INITIAL,
            correlation_id,
            SOURCE_SERVICE,
            self.clock.now(),
        );
        if let Err(e) = self.publisher.publish(&envelope).await {
            tracing::error!(order_id = %order_id, error = %e, "Failed to publish OrderFailed");
        }
    }

    async fn handle_payment_completed(
        &self,
        event: &PaymentCompleted,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let product_ids = self
            .products
            .products_with_reservations_for_order(event.order_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;

        for product_id in product_ids {
            let reservations = self
                .reservations_for(product_id, event.order_id, ReservationState::Active)
                .await?;
            for reservation_id in reservations {
                self.service
                    .confirm(product_id, reservation_id, correlation_id)
                    .await
                    .map_err(|e| HandlerError::from_classified(&e))?;
            }
        }
        tracing::info!(order_id = %event.order_id, "Reservations converted to deductions");
        Ok(())
    }

    async fn handle_payment_failed(
        &self,
        event: &PaymentFailed,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        self.release_all_for_order(
            event.order_id,
            ReleaseReason::PaymentFailed,
            correlation_id,
        )
        .await
    }

    async fn handle_order_cancelled(
        &self,
        event: &OrderCancelled,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let wants_restore = event
            .compensation_actions
            .iter()
            .any(|action| action.action_type == "STOCK_RESTORE");
        if !wants_restore {
            tracing::debug!(order_id = %event.order_id, "Cancellation carries no stock compensation");
            return Ok(());
        }

        self.release_all_for_order(
            event.order_id,
            ReleaseReason::OrderCancelled,
            correlation_id,
        )
        .await?;

        // Already-deducted stock comes back as an inbound correction.
        let product_ids = self
            .products
            .products_with_reservations_for_order(event.order_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        for product_id in product_ids {
            let confirmed = self
                .confirmed_quantity_for(product_id, event.order_id)
                .await?;
            if confirmed > 0 {
                self.service
                    .adjust(
                        product_id,
                        i64::try_from(confirmed).unwrap_or(i64::MAX),
                        "stock return for cancelled order",
                        correlation_id,
                    )
                    .await
                    .map_err(|e| HandlerError::from_classified(&e))?;
            }
        }
        Ok(())
    }

    async fn release_all_for_order(
        &self,
        order_id: OrderId,
        reason: ReleaseReason,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let product_ids = self
            .products
            .products_with_reservations_for_order(order_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;

        for product_id in product_ids {
            self.service
                .release_for_order(product_id, order_id, reason, CONSUMER_NAME, correlation_id)
                .await
                .map_err(|e| HandlerError::from_classified(&e))?;
        }
        Ok(())
    }

    async fn reservations_for(
        &self,
        product_id: ProductId,
        order_id: OrderId,
        state: ReservationState,
    ) -> Result<Vec<ordermesh_core::ids::ReservationId>, HandlerError> {
        let product = self
            .products
            .load(product_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        Ok(product
            .reservations()
            .filter(|r| r.order_id == order_id && r.state == state)
            .map(|r| r.reservation_id)
            .collect())
    }

    async fn confirmed_quantity_for(
        &self,
        product_id: ProductId,
        order_id: OrderId,
    ) -> Result<u64, HandlerError> {
        let product = self
            .products
            .load(product_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        Ok(product
            .reservations()
            .filter(|r| r.order_id == order_id && r.state == ReservationState::Confirmed)
            .map(|r| r.quantity.value())
            .sum())
    }
}

macro_rules! payload_handler {
    ($handler:ident, $variant:ident, $method:ident) => {
        struct $handler {
            consumer: Arc<InventoryConsumer>,
        }

        impl EventHandler for $handler {
            fn handle(
                &self,
                envelope: &EventEnvelope,
            ) -> PortFuture<'_, Result<(), HandlerError>> {
                let envelope = envelope.clone();
                Box::pin(async move {
                    match envelope.payload() {
                        EventPayload::$variant(event) => {
                            self.consumer
                                .$method(event, envelope.correlation_id())
                                .await
                        },
                        other => Err(HandlerError {
                            class: ErrorClass::Fatal,
                            message: format!(
                                "Handler for {} received {}",
                                stringify!($variant),
                                other.event_type()
                            ),
                            details: None,
                        }),
                    }
                })
            }
        }
    };
}

payload_handler!(OrderCreatedHandler, OrderCreated, handle_order_created);
payload_handler!(
    PaymentCompletedHandler,
    PaymentCompleted,
    handle_payment_completed
);
payload_handler!(PaymentFailedHandler, PaymentFailed, handle_payment_failed);
payload_handler!(
    OrderCancelledHandler,
    OrderCancelled,
    handle_order_cancelled
);
