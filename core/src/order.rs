//! The order aggregate and its state machine.
//!
//! Orders are created once, mutated only through self-validating state
//! transitions, and never deleted. Every transition either moves the
//! aggregate along the legal table below, is an idempotent repeat of the
//! terminal transition the order already took (no-op success), or fails with
//! [`OrderError::InvalidTransition`] without mutating anything.
//!
//! ```text
//! PENDING ──confirm──► CONFIRMED ──start_payment──► PAYMENT_PENDING
//!    │                     │                              │
//!    │cancel/fail          │cancel                        │start_payment
//!    ▼                     ▼                              ▼
//! CANCELLED/FAILED     CANCELLED                  PAYMENT_PROCESSING
//!                                                     │        │
//!                                  mark_paid──► PAID  │        └─cancel/fail
//!                                                │    ▼
//!                        start_preparing─────────┤  CANCELLED/FAILED
//!                                                ▼
//!                       PREPARING ──ship──► SHIPPED ──deliver──► DELIVERED
//!                                                                    │
//!                       refund (from PAID/PREPARING/SHIPPED/         │complete
//!                       DELIVERED) ──► REFUNDING ──► REFUNDED        ▼
//!                                                               COMPLETED
//! ```
//!
//! `PAYMENT_PENDING` is deliberately not cancellable: the payment gateway
//! has been engaged but not yet charged, so compensation must flow through
//! `PAYMENT_PROCESSING`.

use crate::error::{Classify, ErrorClass};
use crate::ids::{CustomerId, OrderId, PaymentId, ProductId, ReservationId};
use crate::money::{Money, MoneyError};
use crate::quantity::Quantity;
use crate::version::Version;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum number of line items per order.
pub const MAX_ORDER_ITEMS: usize = 100;

/// How long after payment a customer may still cancel.
pub const CANCELLATION_WINDOW: Duration = Duration::hours(24);

/// Errors from order construction and transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// The requested action is not legal from the current status.
    #[error("Invalid transition: {action} from {from}")]
    InvalidTransition {
        /// Status the order was in.
        from: OrderStatus,
        /// The rejected action.
        action: OrderAction,
    },

    /// The item count is outside `1..=100`.
    #[error("Order must have between 1 and {MAX_ORDER_ITEMS} items, got {count}")]
    ItemCountOutOfRange {
        /// The offending count.
        count: usize,
    },

    /// Two line items reference the same product.
    #[error("Duplicate product in order: {0}")]
    DuplicateProduct(ProductId),

    /// A line item has quantity zero.
    #[error("Line item quantity must be at least 1 for product {0}")]
    ZeroItemQuantity(ProductId),

    /// A line item has a negative unit price.
    #[error("Negative unit price for product {0}")]
    NegativeUnitPrice(ProductId),

    /// Line items do not share a single currency, or totals overflowed.
    #[error("Order amount arithmetic failed: {0}")]
    Amount(#[from] MoneyError),

    /// An identical order from the same customer exists in the duplicate
    /// window.
    #[error("Duplicate of order {existing}")]
    DuplicateOrder {
        /// The already-accepted order.
        existing: OrderId,
    },

    /// Customer-initiated cancellation after the window closed.
    #[error("Cancellation window expired (paid at {paid_at})")]
    CancellationWindowExpired {
        /// When the order was paid.
        paid_at: DateTime<Utc>,
    },
}

impl Classify for OrderError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTransition { .. }
            | Self::DuplicateOrder { .. }
            | Self::CancellationWindowExpired { .. } => ErrorClass::BusinessRule,
            Self::ItemCountOutOfRange { .. }
            | Self::DuplicateProduct(_)
            | Self::ZeroItemQuantity(_)
            | Self::NegativeUnitPrice(_)
            | Self::Amount(_) => ErrorClass::Validation,
        }
    }
}

/// The order lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created, awaiting stock reservation.
    Pending,
    /// Stock reserved and attached.
    Confirmed,
    /// Payment gateway engaged; not cancellable.
    PaymentPending,
    /// Payment in flight.
    PaymentProcessing,
    /// Charged successfully.
    Paid,
    /// Being picked and packed.
    Preparing,
    /// Handed to the carrier.
    Shipped,
    /// Received by the customer.
    Delivered,
    /// Fulfilled end-to-end (terminal).
    Completed,
    /// Cancelled (terminal).
    Cancelled,
    /// Refund in flight.
    Refunding,
    /// Refund settled (terminal).
    Refunded,
    /// Failed before payment settled (terminal).
    Failed,
}

impl OrderStatus {
    /// Whether the status accepts no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Refunded | Self::Failed
        )
    }

    /// Stable SCREAMING_SNAKE label for persistence and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::PaymentPending => "PAYMENT_PENDING",
            Self::PaymentProcessing => "PAYMENT_PROCESSING",
            Self::Paid => "PAID",
            Self::Preparing => "PREPARING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Refunding => "REFUNDING",
            Self::Refunded => "REFUNDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a persisted status label.
    ///
    /// # Errors
    ///
    /// Returns the unrecognised label.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "PAYMENT_PENDING" => Ok(Self::PaymentPending),
            "PAYMENT_PROCESSING" => Ok(Self::PaymentProcessing),
            "PAID" => Ok(Self::Paid),
            "PREPARING" => Ok(Self::Preparing),
            "SHIPPED" => Ok(Self::Shipped),
            "DELIVERED" => Ok(Self::Delivered),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            "REFUNDING" => Ok(Self::Refunding),
            "REFUNDED" => Ok(Self::Refunded),
            "FAILED" => Ok(Self::Failed),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The actions the state machine understands, for error reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    /// Attach reservations and confirm.
    Confirm,
    /// Engage the payment gateway.
    StartPayment,
    /// Record the successful charge.
    MarkPaid,
    /// Cancel the order.
    Cancel,
    /// Begin the refund pathway.
    Refund,
    /// Settle the refund.
    CompleteRefund,
    /// Begin picking and packing.
    StartPreparing,
    /// Hand to the carrier.
    Ship,
    /// Record delivery.
    Deliver,
    /// Close out a delivered order.
    Complete,
    /// Mark the order failed (stock or payment compensation).
    Fail,
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Confirm => "confirm",
            Self::StartPayment => "startPayment",
            Self::MarkPaid => "markPaid",
            Self::Cancel => "cancel",
            Self::Refund => "refund",
            Self::CompleteRefund => "completeRefund",
            Self::StartPreparing => "startPreparing",
            Self::Ship => "ship",
            Self::Deliver => "deliver",
            Self::Complete => "complete",
            Self::Fail => "fail",
        };
        write!(f, "{name}")
    }
}

/// Who initiated a cancellation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    /// The customer, via a request path; subject to the cancellation window.
    Customer,
    /// The system, via saga compensation; not subject to the window.
    System,
}

/// Recorded reason for a cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReason {
    /// Free-text reason.
    pub reason: String,
    /// Who cancelled (customer id, service name, ...).
    pub cancelled_by: String,
    /// The kind of actor.
    pub cancelled_by_type: ActorType,
}

/// One line of an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// The product ordered.
    pub product_id: ProductId,
    /// Display name captured at order time.
    pub product_name: String,
    /// Units ordered (at least 1).
    pub quantity: Quantity,
    /// Price per unit.
    pub unit_price: Money,
    /// `quantity * unit_price`, cached.
    pub line_total: Money,
    /// The stock reservation backing this line, once attached.
    pub reservation_id: Option<ReservationId>,
}

impl OrderItem {
    /// Build a line item, computing the line total.
    ///
    /// # Errors
    ///
    /// [`OrderError::ZeroItemQuantity`], [`OrderError::NegativeUnitPrice`],
    /// or [`OrderError::Amount`] on overflow.
    pub fn new(
        product_id: ProductId,
        product_name: impl Into<String>,
        quantity: Quantity,
        unit_price: Money,
    ) -> Result<Self, OrderError> {
        if quantity.is_zero() {
            return Err(OrderError::ZeroItemQuantity(product_id));
        }
        if unit_price.is_negative() {
            return Err(OrderError::NegativeUnitPrice(product_id));
        }
        let scalar = u32::try_from(quantity.value()).map_err(|_| MoneyError::Overflow)?;
        let line_total = unit_price.checked_mul(scalar)?;
        Ok(Self {
            product_id,
            product_name: product_name.into(),
            quantity,
            unit_price,
            line_total,
            reservation_id: None,
        })
    }
}

/// The order aggregate root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    order_id: OrderId,
    customer_id: CustomerId,
    status: OrderStatus,
    items: Vec<OrderItem>,
    total_amount: Money,
    payment_id: Option<PaymentId>,
    cancellation_reason: Option<CancellationReason>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    content_hash: u64,
    version: Version,
}

impl Order {
    /// Create a new `PENDING` order after validating the item list.
    ///
    /// # Errors
    ///
    /// Any of the item validation errors, or [`OrderError::Amount`] when
    /// line currencies differ or totals overflow.
    pub fn create(
        order_id: OrderId,
        customer_id: CustomerId,
        items: Vec<OrderItem>,
        now: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        if items.is_empty() || items.len() > MAX_ORDER_ITEMS {
            return Err(OrderError::ItemCountOutOfRange { count: items.len() });
        }

        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.product_id) {
                return Err(OrderError::DuplicateProduct(item.product_id));
            }
            if item.quantity.is_zero() {
                return Err(OrderError::ZeroItemQuantity(item.product_id));
            }
            if item.unit_price.is_negative() {
                return Err(OrderError::NegativeUnitPrice(item.product_id));
            }
        }

        let total_amount = Self::sum_lines(&items)?;
        let content_hash = Self::compute_content_hash(customer_id, &items);

        Ok(Self {
            order_id,
            customer_id,
            status: OrderStatus::Pending,
            items,
            total_amount,
            payment_id: None,
            cancellation_reason: None,
            paid_at: None,
            created_at: now,
            last_modified_at: now,
            content_hash,
            version: Version::INITIAL,
        })
    }

    /// Rehydrate an order from persisted state.
    #[allow(clippy::too_many_arguments)] // Row mapping needs every column
    #[must_use]
    pub fn from_parts(
        order_id: OrderId,
        customer_id: CustomerId,
        status: OrderStatus,
        items: Vec<OrderItem>,
        total_amount: Money,
        payment_id: Option<PaymentId>,
        cancellation_reason: Option<CancellationReason>,
        paid_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        last_modified_at: DateTime<Utc>,
        content_hash: u64,
        version: Version,
    ) -> Self {
        Self {
            order_id,
            customer_id,
            status,
            items,
            total_amount,
            payment_id,
            cancellation_reason,
            paid_at,
            created_at,
            last_modified_at,
            content_hash,
            version,
        }
    }

    fn sum_lines(items: &[OrderItem]) -> Result<Money, OrderError> {
        let mut iter = items.iter();
        let first = iter.next().ok_or(OrderError::ItemCountOutOfRange { count: 0 })?;
        let mut total = first.line_total;
        for item in iter {
            total = total.checked_add(item.line_total)?;
        }
        Ok(total)
    }

    /// A stable FNV-1a fold over the customer and the sorted line items.
    ///
    /// Deterministic across processes (unlike the std hasher) so the hash
    /// can back the duplicate-order window in the database.
    #[must_use]
    pub fn compute_content_hash(customer_id: CustomerId, items: &[OrderItem]) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut lines: Vec<(ProductId, u64, i64, String)> = items
            .iter()
            .map(|i| {
                (
                    i.product_id,
                    i.quantity.value(),
                    i.unit_price.minor_units(),
                    i.unit_price.currency().as_str().to_string(),
                )
            })
            .collect();
        lines.sort();

        let mut hash = FNV_OFFSET;
        let mut fold = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };

        fold(customer_id.as_uuid().as_bytes());
        for (product_id, quantity, minor, currency) in &lines {
            fold(product_id.as_uuid().as_bytes());
            fold(&quantity.to_le_bytes());
            fold(&minor.to_le_bytes());
            fold(currency.as_bytes());
        }
        hash
    }

    // ===== Accessors =====

    /// The aggregate id.
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// The ordering customer.
    #[must_use]
    pub const fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    /// The line items.
    #[must_use]
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// Cached order total.
    #[must_use]
    pub const fn total_amount(&self) -> Money {
        self.total_amount
    }

    /// The payment, once charged.
    #[must_use]
    pub const fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    /// Cancellation bookkeeping, if cancelled.
    #[must_use]
    pub const fn cancellation_reason(&self) -> Option<&CancellationReason> {
        self.cancellation_reason.as_ref()
    }

    /// When the order was paid, if it was.
    #[must_use]
    pub const fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at
    }

    /// Creation instant.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last mutation instant.
    #[must_use]
    pub const fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    /// The duplicate-detection content hash.
    #[must_use]
    pub const fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Current aggregate version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    // ===== Transitions =====

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified_at = now;
        self.version = self.version.next();
    }

    fn reject(&self, action: OrderAction) -> OrderError {
        OrderError::InvalidTransition {
            from: self.status,
            action,
        }
    }

    /// Attach the reservation backing each line item (from `StockReserved`).
    ///
    /// Unknown products in `assignments` are ignored; lines without an
    /// assignment keep `None`.
    pub fn attach_reservations(
        &mut self,
        assignments: &[(ProductId, ReservationId)],
        now: DateTime<Utc>,
    ) {
        let mut changed = false;
        for item in &mut self.items {
            if let Some((_, reservation_id)) = assignments
                .iter()
                .find(|(product_id, _)| *product_id == item.product_id)
            {
                if item.reservation_id != Some(*reservation_id) {
                    item.reservation_id = Some(*reservation_id);
                    changed = true;
                }
            }
        }
        if changed {
            self.touch(now);
        }
    }

    /// `PENDING → CONFIRMED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Pending => {
                self.status = OrderStatus::Confirmed;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Confirm)),
        }
    }

    /// `CONFIRMED → PAYMENT_PENDING`, then `PAYMENT_PENDING →
    /// PAYMENT_PROCESSING` on the second call.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn start_payment(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Confirmed => {
                self.status = OrderStatus::PaymentPending;
                self.touch(now);
                Ok(())
            },
            OrderStatus::PaymentPending => {
                self.status = OrderStatus::PaymentProcessing;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::StartPayment)),
        }
    }

    /// `PAYMENT_PROCESSING → PAID`, recording the payment id and instant.
    /// A repeat on an already-`PAID` order is a no-op success that keeps
    /// the originally recorded payment.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn mark_paid(
        &mut self,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Paid => Ok(()),
            OrderStatus::PaymentProcessing => {
                self.status = OrderStatus::Paid;
                self.payment_id = Some(payment_id);
                self.paid_at = Some(now);
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::MarkPaid)),
        }
    }

    /// Cancel the order.
    ///
    /// Legal from `PENDING`, `CONFIRMED`, `PAYMENT_PROCESSING`, `PAID`, and
    /// `PREPARING`. `PAYMENT_PENDING` is explicitly not cancellable.
    /// Customer-initiated cancellation after payment is bounded by the
    /// 24-hour window. Cancelling an already-`CANCELLED` order is a no-op
    /// success.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] or
    /// [`OrderError::CancellationWindowExpired`].
    pub fn cancel(
        &mut self,
        reason: CancellationReason,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Cancelled => Ok(()),
            OrderStatus::Pending
            | OrderStatus::Confirmed
            | OrderStatus::PaymentProcessing => {
                self.status = OrderStatus::Cancelled;
                self.cancellation_reason = Some(reason);
                self.touch(now);
                Ok(())
            },
            OrderStatus::Paid | OrderStatus::Preparing => {
                if reason.cancelled_by_type == ActorType::Customer {
                    if let Some(paid_at) = self.paid_at {
                        if now > paid_at + CANCELLATION_WINDOW {
                            return Err(OrderError::CancellationWindowExpired { paid_at });
                        }
                    }
                }
                self.status = OrderStatus::Cancelled;
                self.cancellation_reason = Some(reason);
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Cancel)),
        }
    }

    /// Begin the refund pathway. Legal from `PAID`, `PREPARING`, `SHIPPED`,
    /// and `DELIVERED`; a repeat on `REFUNDING` is a no-op success.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Refunding => Ok(()),
            OrderStatus::Paid
            | OrderStatus::Preparing
            | OrderStatus::Shipped
            | OrderStatus::Delivered => {
                self.status = OrderStatus::Refunding;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Refund)),
        }
    }

    /// Settle the refund: `REFUNDING → REFUNDED`. Idempotent on `REFUNDED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn complete_refund(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Refunded => Ok(()),
            OrderStatus::Refunding => {
                self.status = OrderStatus::Refunded;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::CompleteRefund)),
        }
    }

    /// `PAID → PREPARING`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn start_preparing(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Paid => {
                self.status = OrderStatus::Preparing;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::StartPreparing)),
        }
    }

    /// `PREPARING → SHIPPED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn ship(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Preparing => {
                self.status = OrderStatus::Shipped;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Ship)),
        }
    }

    /// `SHIPPED → DELIVERED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn deliver(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Shipped => {
                self.status = OrderStatus::Delivered;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Deliver)),
        }
    }

    /// `DELIVERED → COMPLETED`. Idempotent on `COMPLETED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Completed => Ok(()),
            OrderStatus::Delivered => {
                self.status = OrderStatus::Completed;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Complete)),
        }
    }

    /// Mark the order failed. Used by saga compensation when stock cannot be
    /// reserved (`PENDING`) or payment is declined (`PAYMENT_PROCESSING`).
    /// Idempotent on `FAILED`.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] from any other status.
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Failed => Ok(()),
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::PaymentProcessing => {
                self.status = OrderStatus::Failed;
                self.touch(now);
                Ok(())
            },
            _ => Err(self.reject(OrderAction::Fail)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::money::Currency;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn usd(minor: i64) -> Money {
        Money::from_minor_units(minor, Currency::USD)
    }

    fn item(qty: u64, unit_minor: i64) -> OrderItem {
        OrderItem::new(ProductId::new(), "Widget", Quantity::new(qty), usd(unit_minor)).unwrap()
    }

    fn order_with(items: Vec<OrderItem>) -> Order {
        Order::create(OrderId::new(), CustomerId::new(), items, fixed_now()).unwrap()
    }

    fn system_cancel() -> CancellationReason {
        CancellationReason {
            reason: "payment failed".to_string(),
            cancelled_by: "order-saga".to_string(),
            cancelled_by_type: ActorType::System,
        }
    }

    fn customer_cancel() -> CancellationReason {
        CancellationReason {
            reason: "changed my mind".to_string(),
            cancelled_by: "customer".to_string(),
            cancelled_by_type: ActorType::Customer,
        }
    }

    fn drive_to_paid(order: &mut Order) {
        let now = fixed_now();
        order.confirm(now).unwrap();
        order.start_payment(now).unwrap();
        order.start_payment(now).unwrap();
        order.mark_paid(PaymentId::new(), now).unwrap();
    }

    #[test]
    fn create_computes_total() {
        let order = order_with(vec![item(3, 1000), item(1, 250)]);
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.total_amount(), usd(3250));
        assert_eq!(order.version(), Version::INITIAL);
        assert!(order.payment_id().is_none());
    }

    #[test]
    fn create_rejects_empty_and_oversized() {
        let empty = Order::create(OrderId::new(), CustomerId::new(), vec![], fixed_now());
        assert_eq!(empty.unwrap_err(), OrderError::ItemCountOutOfRange { count: 0 });

        let items: Vec<_> = (0..101).map(|_| item(1, 100)).collect();
        let too_many = Order::create(OrderId::new(), CustomerId::new(), items, fixed_now());
        assert_eq!(
            too_many.unwrap_err(),
            OrderError::ItemCountOutOfRange { count: 101 }
        );
    }

    #[test]
    fn create_rejects_duplicate_product_lines() {
        let product_id = ProductId::new();
        let a = OrderItem::new(product_id, "Widget", Quantity::new(1), usd(100)).unwrap();
        let b = OrderItem::new(product_id, "Widget", Quantity::new(2), usd(100)).unwrap();
        let result = Order::create(OrderId::new(), CustomerId::new(), vec![a, b], fixed_now());
        assert_eq!(result.unwrap_err(), OrderError::DuplicateProduct(product_id));
    }

    #[test]
    fn create_rejects_currency_mismatch() {
        let a = item(1, 100);
        let b = OrderItem::new(
            ProductId::new(),
            "Gadget",
            Quantity::new(1),
            Money::from_minor_units(100, Currency::EUR),
        )
        .unwrap();
        let result = Order::create(OrderId::new(), CustomerId::new(), vec![a, b], fixed_now());
        assert!(matches!(result.unwrap_err(), OrderError::Amount(_)));
    }

    #[test]
    fn item_rejects_zero_quantity_and_negative_price() {
        let zero = OrderItem::new(ProductId::new(), "W", Quantity::ZERO, usd(100));
        assert!(matches!(zero, Err(OrderError::ZeroItemQuantity(_))));

        let negative = OrderItem::new(ProductId::new(), "W", Quantity::new(1), usd(-1));
        assert!(matches!(negative, Err(OrderError::NegativeUnitPrice(_))));
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut order = order_with(vec![item(1, 500)]);
        let now = fixed_now();

        drive_to_paid(&mut order);
        assert_eq!(order.status(), OrderStatus::Paid);
        assert!(order.payment_id().is_some());
        assert_eq!(order.paid_at(), Some(now));

        order.start_preparing(now).unwrap();
        order.ship(now).unwrap();
        order.deliver(now).unwrap();
        order.complete(now).unwrap();
        assert_eq!(order.status(), OrderStatus::Completed);
        assert!(order.status().is_terminal());
    }

    #[test]
    fn payment_pending_is_not_cancellable() {
        let mut order = order_with(vec![item(1, 500)]);
        let now = fixed_now();
        order.confirm(now).unwrap();
        order.start_payment(now).unwrap();
        assert_eq!(order.status(), OrderStatus::PaymentPending);

        let result = order.cancel(system_cancel(), now);
        assert_eq!(
            result.unwrap_err(),
            OrderError::InvalidTransition {
                from: OrderStatus::PaymentPending,
                action: OrderAction::Cancel,
            }
        );
        assert_eq!(order.status(), OrderStatus::PaymentPending);
    }

    #[test]
    fn customer_cancel_respects_window() {
        let mut order = order_with(vec![item(1, 500)]);
        drive_to_paid(&mut order);
        let paid_at = order.paid_at().unwrap();

        // Inside the window: allowed.
        let mut inside = order.clone();
        inside
            .cancel(customer_cancel(), paid_at + Duration::hours(23))
            .unwrap();
        assert_eq!(inside.status(), OrderStatus::Cancelled);

        // Outside the window: rejected for customers...
        let late = paid_at + Duration::hours(25);
        let result = order.clone().cancel(customer_cancel(), late);
        assert_eq!(
            result.unwrap_err(),
            OrderError::CancellationWindowExpired { paid_at }
        );

        // ...but still allowed for system compensation.
        order.cancel(system_cancel(), late).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn terminal_states_reject_everything_but_repeats() {
        let mut order = order_with(vec![item(1, 500)]);
        let now = fixed_now();
        order.cancel(system_cancel(), now).unwrap();
        let version = order.version();

        // Idempotent repeat of the same terminal transition.
        order.cancel(system_cancel(), now).unwrap();
        assert_eq!(order.version(), version, "no-op repeat must not bump");

        // Everything else fails loudly.
        assert!(order.confirm(now).is_err());
        assert!(order.start_payment(now).is_err());
        assert!(order.mark_paid(PaymentId::new(), now).is_err());
        assert!(order.refund(now).is_err());
        assert!(order.ship(now).is_err());
        assert!(order.deliver(now).is_err());
        assert!(order.complete(now).is_err());
        assert!(order.fail(now).is_err());
    }

    #[test]
    fn fail_is_legal_from_pending_and_processing() {
        let now = fixed_now();

        let mut from_pending = order_with(vec![item(1, 500)]);
        from_pending.fail(now).unwrap();
        assert_eq!(from_pending.status(), OrderStatus::Failed);
        // Idempotent repeat.
        from_pending.fail(now).unwrap();

        let mut from_processing = order_with(vec![item(1, 500)]);
        from_processing.confirm(now).unwrap();
        from_processing.start_payment(now).unwrap();
        from_processing.start_payment(now).unwrap();
        from_processing.fail(now).unwrap();
        assert_eq!(from_processing.status(), OrderStatus::Failed);
    }

    #[test]
    fn refund_pathway() {
        let mut order = order_with(vec![item(2, 750)]);
        drive_to_paid(&mut order);
        let now = fixed_now();

        order.refund(now).unwrap();
        assert_eq!(order.status(), OrderStatus::Refunding);
        // Repeat while refunding is a no-op success.
        order.refund(now).unwrap();

        order.complete_refund(now).unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);
        order.complete_refund(now).unwrap();
        assert!(order.status().is_terminal());
    }

    #[test]
    fn attach_reservations_fills_matching_lines() {
        let first = item(1, 100);
        let second = item(2, 200);
        let first_product = first.product_id;
        let mut order = order_with(vec![first, second]);
        let reservation_id = ReservationId::new();

        order.attach_reservations(&[(first_product, reservation_id)], fixed_now());

        assert_eq!(order.items()[0].reservation_id, Some(reservation_id));
        assert_eq!(order.items()[1].reservation_id, None);
    }

    #[test]
    fn invalid_transition_does_not_mutate() {
        let mut order = order_with(vec![item(1, 100)]);
        let snapshot = order.clone();

        assert!(order.ship(fixed_now()).is_err());
        assert_eq!(order, snapshot);
    }

    #[test]
    fn content_hash_is_stable_and_order_insensitive() {
        let a = item(1, 100);
        let b = item(2, 200);
        let customer = CustomerId::new();

        let forward = Order::compute_content_hash(customer, &[a.clone(), b.clone()]);
        let backward = Order::compute_content_hash(customer, &[b, a.clone()]);
        assert_eq!(forward, backward);

        let other_customer = Order::compute_content_hash(CustomerId::new(), &[a]);
        assert_ne!(forward, other_customer);
    }

    #[test]
    fn status_labels_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::PaymentPending,
            OrderStatus::PaymentProcessing,
            OrderStatus::Paid,
            OrderStatus::Preparing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Refunding,
            OrderStatus::Refunded,
            OrderStatus::Failed,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::parse("BOGUS").is_err());
    }
}
