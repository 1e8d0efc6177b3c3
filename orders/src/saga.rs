//! The order saga coordinator.
//!
//! Orchestrated from the order context: `OrderCreated` has already fanned
//! out to inventory, and this coordinator consumes what comes back.
//!
//! - `StockReserved` (one per product) → attach the reservation to its
//!   line; once every line is backed, drive `PENDING → CONFIRMED →
//!   PAYMENT_PENDING → PAYMENT_PROCESSING`, invoke the payment adapter,
//!   and on approval mark `PAID` + publish `PaymentCompleted`. A decline
//!   publishes `PaymentFailed` (inventory releases the reservations) and
//!   cancels the order.
//! - `OrderFailed` (inventory could not reserve) → the order fails.
//!
//! Every handler is an idempotent continuation: it inspects the order's
//! current status and only performs the step that status calls for, so a
//! re-delivered or re-driven event cannot double-charge or double-cancel.

use crate::payment::PaymentAdapter;
use crate::service::{OrderService, SOURCE_SERVICE};
use crate::OrdersError;
use ordermesh_core::events::{
    EventPayload, OrderFailed, PaymentCompleted, PaymentFailed, StockReserved,
};
use ordermesh_core::ids::{CorrelationId, OrderId, ProductId, ReservationId};
use ordermesh_core::order::{ActorType, Order, OrderStatus};
use ordermesh_core::ports::{Clock, PaymentOutcome, PaymentRequest, PortFuture};
use ordermesh_core::{ErrorClass, EventEnvelope};
use ordermesh_runtime::dispatcher::{EventHandler, HandlerError};
use std::sync::Arc;

/// The consumer-group name for the order saga.
pub const CONSUMER_NAME: &str = "order-saga";

/// The saga coordinator.
pub struct OrderSaga {
    service: Arc<OrderService>,
    payments: Arc<PaymentAdapter>,
    clock: Arc<dyn Clock>,
}

impl OrderSaga {
    /// Wire the coordinator to its resources.
    #[must_use]
    pub fn new(
        service: Arc<OrderService>,
        payments: Arc<PaymentAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            payments,
            clock,
        }
    }

    /// The topics this consumer subscribes to.
    #[must_use]
    pub const fn topics() -> [&'static str; 2] {
        ["stock-reserved", "order-failed"]
    }

    /// Register the saga handlers on a dispatcher.
    #[must_use]
    pub fn register(
        self: &Arc<Self>,
        dispatcher: ordermesh_runtime::Dispatcher,
    ) -> ordermesh_runtime::Dispatcher {
        dispatcher
            .register(
                "StockReserved.v1",
                Arc::new(StockReservedHandler {
                    saga: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
            .register(
                "OrderFailed.v1",
                Arc::new(OrderFailedHandler {
                    saga: Arc::clone(self),
                }) as Arc<dyn EventHandler>,
            )
    }

    async fn handle_stock_reserved(
        &self,
        event: &StockReserved,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let assignments: Vec<(ProductId, ReservationId)> = event
            .items
            .iter()
            .map(|item| (item.product_id, event.reservation_id))
            .collect();

        let (order, _) = self
            .service
            .mutate(event.order_id, move |order, now| {
                order.attach_reservations(&assignments, now);
                Ok(())
            })
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;

        let all_reserved = order.items().iter().all(|item| item.reservation_id.is_some());
        if !all_reserved {
            tracing::debug!(
                order_id = %event.order_id,
                "Waiting for remaining reservations"
            );
            return Ok(());
        }

        self.continue_toward_payment(order, correlation_id).await
    }

    /// Drive the order from wherever it stands toward settlement. Called
    /// on first full reservation and again on any re-delivery, so each arm
    /// is conditional on the current status.
    async fn continue_toward_payment(
        &self,
        order: Order,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let order_id = order.order_id();

        if order.status() == OrderStatus::Pending {
            self.service
                .mutate(order_id, |order, now| {
                    order.confirm(now)?;
                    order.start_payment(now)?; // -> PAYMENT_PENDING
                    order.start_payment(now) // -> PAYMENT_PROCESSING
                })
                .await
                .map_err(|e| HandlerError::from_classified(&e))?;
        }

        let order = self
            .service
            .order(order_id)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        if order.status() != OrderStatus::PaymentProcessing {
            // Already settled (or cancelled) by an earlier delivery.
            return Ok(());
        }

        self.charge(&order, correlation_id).await
    }

    async fn charge(
        &self,
        order: &Order,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let request = PaymentRequest {
            order_id: order.order_id(),
            customer_id: order.customer_id(),
            amount: order.total_amount(),
            method: "CARD".to_string(),
        };

        match self.payments.charge(&request).await {
            Ok(PaymentOutcome::Approved {
                payment_id,
                transaction_id,
            }) => {
                let (order, changed) = self
                    .service
                    .mutate(order.order_id(), move |order, now| {
                        order.mark_paid(payment_id, now)
                    })
                    .await
                    .map_err(|e| HandlerError::from_classified(&e))?;

                if changed {
                    let completed = PaymentCompleted {
                        payment_id,
                        order_id: order.order_id(),
                        customer_id: order.customer_id(),
                        amount: order.total_amount().minor_units(),
                        currency: order.total_amount().currency(),
                        payment_method: request.method,
                        transaction_id,
                        paid_at: self.clock.now(),
                    };
                    self.service
                        .publish(EventPayload::PaymentCompleted(completed), &order, correlation_id)
                        .await;
                    tracing::info!(order_id = %order.order_id(), "Order paid");
                    metrics::counter!("saga.payments_completed").increment(1);
                }
                Ok(())
            },
            Ok(PaymentOutcome::Declined { reason }) => {
                tracing::warn!(order_id = %order.order_id(), reason = %reason, "Payment declined");
                metrics::counter!("saga.payments_declined").increment(1);
                self.compensate_declined(order, &reason, correlation_id)
                    .await
            },
            Err(e) => {
                // Transient gateway failure after retries: leave the order
                // in PAYMENT_PROCESSING and let the delivery be retried.
                Err(HandlerError::from_classified(&e))
            },
        }
    }

    /// The payment-declined compensation: emit `PaymentFailed` so the
    /// inventory context releases the reservations, then cancel the order.
    async fn compensate_declined(
        &self,
        order: &Order,
        reason: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        let failed = PaymentFailed {
            order_id: order.order_id(),
            customer_id: order.customer_id(),
            reason: reason.to_string(),
            failed_at: self.clock.now(),
        };
        self.service
            .publish(EventPayload::PaymentFailed(failed), order, correlation_id)
            .await;

        self.service
            .cancel_order(
                order.order_id(),
                format!("payment declined: {reason}"),
                SOURCE_SERVICE,
                ActorType::System,
                correlation_id,
            )
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        Ok(())
    }

    async fn handle_order_failed(
        &self,
        event: &OrderFailed,
        _correlation_id: CorrelationId,
    ) -> Result<(), HandlerError> {
        self.fail_order(event.order_id).await
    }

    async fn fail_order(&self, order_id: OrderId) -> Result<(), HandlerError> {
        let (_, changed) = self
            .service
            .mutate(order_id, Order::fail)
            .await
            .map_err(|e| HandlerError::from_classified(&e))?;
        if changed {
            tracing::warn!(order_id = %order_id, "Order failed");
            metrics::counter!("saga.orders_failed").increment(1);
        }
        Ok(())
    }
}

macro_rules! payload_handler {
    ($handler:ident, $variant:ident, $method:ident) => {
        struct $handler {
            saga: Arc<OrderSaga>,
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
                            self.saga.$method(event, envelope.correlation_id()).await
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

payload_handler!(StockReservedHandler, StockReserved, handle_stock_reserved);
payload_handler!(OrderFailedHandler, OrderFailed, handle_order_failed);
