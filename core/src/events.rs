//! Domain event payloads.
//!
//! Every integration event the system publishes is one variant of
//! [`EventPayload`], a tagged union over per-event wire structs. Field names
//! serialize to the canonical camelCase wire names. Each payload knows its
//! versioned type tag (`Name.v1`), its topic, and the aggregate it belongs
//! to — the aggregate id doubles as the broker partition key, which is what
//! gives one aggregate's events their in-order delivery.

use crate::ids::{CustomerId, OrderId, PaymentId, ProductId, ReservationId};
use crate::money::{Currency, Money};
use crate::order::ActorType;
use crate::product::ReleaseReason;
use crate::quantity::Quantity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A line of an `OrderCreated` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedItem {
    /// The product ordered.
    pub product_id: ProductId,
    /// Units ordered.
    pub quantity: Quantity,
    /// Unit price in minor units.
    pub unit_price: i64,
    /// Currency of the unit price.
    pub currency: Currency,
}

/// Published when an order is accepted in `PENDING`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// The new order.
    pub order_id: OrderId,
    /// The ordering customer.
    pub customer_id: CustomerId,
    /// The order lines.
    pub items: Vec<OrderCreatedItem>,
    /// The order total.
    pub total_amount: Money,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
}

/// A stock line inside reservation/release/deduction events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockItem {
    /// The product.
    pub product_id: ProductId,
    /// Units affected.
    pub quantity: Quantity,
    /// The warehouse holding the units.
    pub warehouse_id: String,
}

/// Published when stock has been reserved for an order line.
///
/// One event per product: the inventory aggregate is the product, so a
/// multi-line order produces one `StockReserved` per line, each ordered
/// within its own product's partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    /// The inventory (product) aggregate.
    pub inventory_id: ProductId,
    /// The reservation taken.
    pub reservation_id: ReservationId,
    /// The order the stock is held for.
    pub order_id: OrderId,
    /// The affected stock lines.
    pub items: Vec<StockItem>,
    /// When the reservation lapses.
    pub expires_at: DateTime<Utc>,
}

/// Published when reserved stock returns to availability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReleased {
    /// The inventory (product) aggregate.
    pub inventory_id: ProductId,
    /// The released reservation.
    pub reservation_id: ReservationId,
    /// The order the stock was held for.
    pub order_id: OrderId,
    /// Why the stock was released.
    pub release_reason: ReleaseReason,
    /// The affected stock lines.
    pub items: Vec<StockItem>,
    /// Who released (service name or customer id).
    pub released_by: String,
    /// The kind of actor that released.
    pub released_by_type: ActorType,
}

/// Published when a confirmed reservation is converted to a deduction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDeducted {
    /// The inventory (product) aggregate.
    pub inventory_id: ProductId,
    /// The confirmed reservation.
    pub reservation_id: ReservationId,
    /// The order the stock left for.
    pub order_id: OrderId,
    /// The affected stock lines.
    pub items: Vec<StockItem>,
    /// When the deduction was applied.
    pub deducted_at: DateTime<Utc>,
}

/// Published when the payment gateway approves a charge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    /// The payment record.
    pub payment_id: PaymentId,
    /// The paid order.
    pub order_id: OrderId,
    /// The paying customer.
    pub customer_id: CustomerId,
    /// Charged amount in minor units.
    pub amount: i64,
    /// Currency of the charge.
    pub currency: Currency,
    /// Payment method label (e.g. `CARD`).
    pub payment_method: String,
    /// Gateway transaction reference.
    pub transaction_id: String,
    /// When the charge settled.
    pub paid_at: DateTime<Utc>,
}

/// Published when the payment gateway declines or the charge cannot settle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    /// The order whose payment failed.
    pub order_id: OrderId,
    /// The paying customer.
    pub customer_id: CustomerId,
    /// Gateway-reported reason.
    pub reason: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// A compensation step requested of another service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationAction {
    /// What to do (e.g. `STOCK_RESTORE`).
    pub action_type: String,
    /// Which service should act.
    pub target_service: String,
    /// Free-form action parameters.
    pub action_data: serde_json::Value,
}

impl CompensationAction {
    /// The stock-restore compensation directed at the inventory service.
    #[must_use]
    pub fn stock_restore(order_id: OrderId) -> Self {
        Self {
            action_type: "STOCK_RESTORE".to_string(),
            target_service: "inventory-service".to_string(),
            action_data: serde_json::json!({ "orderId": order_id }),
        }
    }
}

/// Published when an order is cancelled, carrying the compensations the
/// other context must apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    /// The cancelled order.
    pub order_id: OrderId,
    /// Free-text reason.
    pub cancel_reason: String,
    /// Stable machine-readable reason code.
    pub cancel_reason_code: String,
    /// Who cancelled.
    pub cancelled_by: String,
    /// The kind of actor.
    pub cancelled_by_type: ActorType,
    /// Compensations to apply.
    pub compensation_actions: Vec<CompensationAction>,
}

/// Published when an order fails before payment settles (e.g. insufficient
/// stock).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFailed {
    /// The failed order.
    pub order_id: OrderId,
    /// Why it failed.
    pub reason: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// A product whose availability fell to or below its threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockItem {
    /// The product.
    pub product_id: ProductId,
    /// Units still available.
    pub available: Quantity,
    /// The alert threshold.
    pub threshold: Quantity,
}

/// Fire-and-forget signal that availability crossed the alert threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowStockAlert {
    /// The inventory (product) aggregate.
    pub inventory_id: ProductId,
    /// Severity label (`WARNING` or `CRITICAL`).
    pub alert_level: String,
    /// The products below threshold.
    pub low_stock_items: Vec<LowStockItem>,
}

/// The tagged union of every event this system publishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)] // Variant names mirror their payload structs
pub enum EventPayload {
    OrderCreated(OrderCreated),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
    StockDeducted(StockDeducted),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    OrderCancelled(OrderCancelled),
    OrderFailed(OrderFailed),
    LowStockAlert(LowStockAlert),
}

impl EventPayload {
    /// The versioned wire type tag.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => "OrderCreated.v1",
            Self::StockReserved(_) => "StockReserved.v1",
            Self::StockReleased(_) => "StockReleased.v1",
            Self::StockDeducted(_) => "StockDeducted.v1",
            Self::PaymentCompleted(_) => "PaymentCompleted.v1",
            Self::PaymentFailed(_) => "PaymentFailed.v1",
            Self::OrderCancelled(_) => "OrderCancelled.v1",
            Self::OrderFailed(_) => "OrderFailed.v1",
            Self::LowStockAlert(_) => "LowStockAlert.v1",
        }
    }

    /// The broker topic for this event type (one topic per type).
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => "order-created",
            Self::StockReserved(_) => "stock-reserved",
            Self::StockReleased(_) => "stock-released",
            Self::StockDeducted(_) => "stock-deducted",
            Self::PaymentCompleted(_) => "payment-completed",
            Self::PaymentFailed(_) => "payment-failed",
            Self::OrderCancelled(_) => "order-cancelled",
            Self::OrderFailed(_) => "order-failed",
            Self::LowStockAlert(_) => "low-stock-alert",
        }
    }

    /// The owning aggregate's id in canonical text form. This is also the
    /// partition key.
    #[must_use]
    pub fn aggregate_id(&self) -> String {
        match self {
            Self::OrderCreated(e) => e.order_id.to_string(),
            Self::StockReserved(e) => e.inventory_id.to_string(),
            Self::StockReleased(e) => e.inventory_id.to_string(),
            Self::StockDeducted(e) => e.inventory_id.to_string(),
            Self::PaymentCompleted(e) => e.order_id.to_string(),
            Self::PaymentFailed(e) => e.order_id.to_string(),
            Self::OrderCancelled(e) => e.order_id.to_string(),
            Self::OrderFailed(e) => e.order_id.to_string(),
            Self::LowStockAlert(e) => e.inventory_id.to_string(),
        }
    }

    /// The owning aggregate's type label.
    #[must_use]
    pub const fn aggregate_type(&self) -> &'static str {
        match self {
            Self::OrderCreated(_)
            | Self::PaymentCompleted(_)
            | Self::PaymentFailed(_)
            | Self::OrderCancelled(_)
            | Self::OrderFailed(_) => "order",
            Self::StockReserved(_)
            | Self::StockReleased(_)
            | Self::StockDeducted(_)
            | Self::LowStockAlert(_) => "product",
        }
    }

    /// Every topic the system publishes to, for subscriber wiring.
    #[must_use]
    pub const fn all_topics() -> [&'static str; 9] {
        [
            "order-created",
            "stock-reserved",
            "stock-released",
            "stock-deducted",
            "payment-completed",
            "payment-failed",
            "order-cancelled",
            "order-failed",
            "low-stock-alert",
        ]
    }
}
