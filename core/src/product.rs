//! The product aggregate and its reservation ledger.
//!
//! A product owns its stock levels and every reservation against them. All
//! mutations go through the aggregate so the ledger invariants hold after
//! every committed change:
//!
//! 1. `total = available + reserved`
//! 2. `available >= 0` and `reserved >= 0` (enforced by [`Quantity`])
//! 3. `reserved` equals the sum of quantities of `Active` reservations
//! 4. Each reservation id appears at most once
//! 5. The version strictly increases on every mutation
//!
//! Mutations are pure in-memory operations; callers serialise them per
//! product with the distributed lock and persist with an optimistic version
//! check.

use crate::error::{Classify, ErrorClass};
use crate::ids::{OrderId, ProductId, ReservationId};
use crate::quantity::{Quantity, QuantityError};
use crate::version::Version;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Default warehouse for reservations; no multi-warehouse routing exists.
pub const DEFAULT_WAREHOUSE: &str = "MAIN";

/// Errors from stock-ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// The product is not active and cannot take reservations.
    #[error("Product {0} is inactive")]
    ProductInactive(ProductId),

    /// Requested more than is currently available.
    #[error("Insufficient stock: requested {requested}, available {available}")]
    InsufficientStock {
        /// The requested quantity.
        requested: Quantity,
        /// The quantity currently available.
        available: Quantity,
    },

    /// A zero-quantity reservation is meaningless and rejected.
    #[error("Reservation quantity must be positive")]
    ZeroQuantity,

    /// No reservation with this id exists on the product.
    #[error("Reservation {0} not found")]
    ReservationNotFound(ReservationId),

    /// The reservation is in a state that forbids the operation.
    #[error("Reservation {reservation_id} is {state:?} and cannot be confirmed")]
    ReservationInvalid {
        /// The reservation in question.
        reservation_id: ReservationId,
        /// Its current state.
        state: ReservationState,
    },

    /// Release was attempted on a reservation already converted to a
    /// deduction.
    #[error("Reservation {0} is already confirmed")]
    AlreadyConfirmed(ReservationId),

    /// An adjustment or internal transfer failed the quantity arithmetic.
    #[error("Stock arithmetic failed: {0}")]
    Arithmetic(#[from] QuantityError),
}

impl Classify for StockError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::ProductInactive(_)
            | Self::InsufficientStock { .. }
            | Self::ReservationInvalid { .. }
            | Self::AlreadyConfirmed(_) => ErrorClass::BusinessRule,
            Self::ZeroQuantity | Self::Arithmetic(_) => ErrorClass::Validation,
            Self::ReservationNotFound(_) => ErrorClass::NotFound,
        }
    }
}

/// Lifecycle of a reservation. `Active` is the only non-terminal state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    /// Holding stock, counted in `reserved`.
    Active,
    /// Converted to a deduction; stock has left the ledger.
    Confirmed,
    /// Returned to `available`.
    Released,
    /// Lapsed past its expiry and returned to `available` by the sweeper.
    Expired,
}

impl ReservationState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Stable SCREAMING_SNAKE label for persistence and the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Confirmed => "CONFIRMED",
            Self::Released => "RELEASED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse a persisted state label.
    ///
    /// # Errors
    ///
    /// Returns the unrecognised label.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "CONFIRMED" => Ok(Self::Confirmed),
            "RELEASED" => Ok(Self::Released),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(other.to_string()),
        }
    }
}

/// Why stock was released back to availability.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseReason {
    /// The owning order was cancelled.
    OrderCancelled,
    /// The reservation lapsed past `expires_at`.
    Expired,
    /// Payment for the owning order failed.
    PaymentFailed,
    /// Operator or system-initiated correction.
    SystemError,
}

/// A time-bounded claim on stock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique id of this reservation.
    pub reservation_id: ReservationId,
    /// The order that claimed the stock.
    pub order_id: OrderId,
    /// How many units are claimed.
    pub quantity: Quantity,
    /// Current lifecycle state.
    pub state: ReservationState,
    /// Warehouse the claim is against (opaque, defaults to [`DEFAULT_WAREHOUSE`]).
    pub warehouse_id: String,
    /// When the claim was made.
    pub created_at: DateTime<Utc>,
    /// When an `Active` claim lapses.
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Whether the reservation has lapsed at `now` (only meaningful while
    /// `Active`).
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Active && self.expires_at <= now
    }
}

/// The three stock counters, kept in lock-step by the aggregate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    /// Units owned in total (available + reserved).
    pub total: Quantity,
    /// Units free to reserve.
    pub available: Quantity,
    /// Units held by active reservations.
    pub reserved: Quantity,
}

/// The product aggregate root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    product_id: ProductId,
    name: String,
    active: bool,
    stock: StockLevels,
    reservations: HashMap<ReservationId, Reservation>,
    low_stock_threshold: Quantity,
    version: Version,
}

impl Product {
    /// Create a product with an initial fully-available stock level.
    #[must_use]
    pub fn new(
        product_id: ProductId,
        name: impl Into<String>,
        initial_total: Quantity,
        low_stock_threshold: Quantity,
    ) -> Self {
        Self {
            product_id,
            name: name.into(),
            active: true,
            stock: StockLevels {
                total: initial_total,
                available: initial_total,
                reserved: Quantity::ZERO,
            },
            reservations: HashMap::new(),
            low_stock_threshold,
            version: Version::INITIAL,
        }
    }

    /// Rehydrate a product from persisted state. The caller is responsible
    /// for passing counters that already satisfy the ledger invariants.
    #[must_use]
    pub fn from_parts(
        product_id: ProductId,
        name: String,
        active: bool,
        stock: StockLevels,
        reservations: Vec<Reservation>,
        low_stock_threshold: Quantity,
        version: Version,
    ) -> Self {
        Self {
            product_id,
            name,
            active,
            stock,
            reservations: reservations
                .into_iter()
                .map(|r| (r.reservation_id, r))
                .collect(),
            low_stock_threshold,
            version,
        }
    }

    /// The aggregate id.
    #[must_use]
    pub const fn product_id(&self) -> ProductId {
        self.product_id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the product accepts reservations.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Current stock counters.
    #[must_use]
    pub const fn stock(&self) -> StockLevels {
        self.stock
    }

    /// Current aggregate version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The low-stock alert threshold.
    #[must_use]
    pub const fn low_stock_threshold(&self) -> Quantity {
        self.low_stock_threshold
    }

    /// Look up a reservation.
    #[must_use]
    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    /// All reservations, in no particular order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    /// Whether available stock has fallen to or below the alert threshold.
    #[must_use]
    pub fn is_low_stock(&self) -> bool {
        self.stock.available <= self.low_stock_threshold
    }

    /// Activate or deactivate the product. Deactivation stops new
    /// reservations; existing ones run their course.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            self.active = active;
            self.version = self.version.next();
        }
    }

    /// Claim `quantity` units for `order_id` until `now + ttl`.
    ///
    /// Moves the quantity from `available` to `reserved` and records an
    /// `Active` reservation. Re-reserving for an order that already holds
    /// an `Active` reservation of the same quantity returns that
    /// reservation unchanged, so a re-delivered reservation request cannot
    /// double-claim stock.
    ///
    /// # Errors
    ///
    /// [`StockError::ProductInactive`], [`StockError::ZeroQuantity`], or
    /// [`StockError::InsufficientStock`] when the preconditions fail; the
    /// aggregate is untouched on error.
    pub fn reserve(
        &mut self,
        order_id: OrderId,
        quantity: Quantity,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, StockError> {
        if !self.active {
            return Err(StockError::ProductInactive(self.product_id));
        }
        if quantity.is_zero() {
            return Err(StockError::ZeroQuantity);
        }
        if let Some(existing) = self
            .reservations
            .values()
            .find(|r| {
                r.order_id == order_id
                    && r.state == ReservationState::Active
                    && r.quantity == quantity
            })
        {
            return Ok(existing.clone());
        }
        if self.stock.available < quantity {
            return Err(StockError::InsufficientStock {
                requested: quantity,
                available: self.stock.available,
            });
        }

        self.stock.available = self.stock.available.checked_sub(quantity)?;
        self.stock.reserved = self.stock.reserved.checked_add(quantity)?;

        let reservation = Reservation {
            reservation_id: ReservationId::new(),
            order_id,
            quantity,
            state: ReservationState::Active,
            warehouse_id: DEFAULT_WAREHOUSE.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.reservations
            .insert(reservation.reservation_id, reservation.clone());
        self.version = self.version.next();
        Ok(reservation)
    }

    /// Convert an `Active` reservation into a deduction: the quantity leaves
    /// both `reserved` and `total`.
    ///
    /// Re-confirming a `Confirmed` reservation is a no-op success.
    ///
    /// # Errors
    ///
    /// [`StockError::ReservationNotFound`] for an unknown id;
    /// [`StockError::ReservationInvalid`] when the reservation is `Released`
    /// or `Expired`.
    pub fn confirm(&mut self, reservation_id: ReservationId) -> Result<Quantity, StockError> {
        let reservation = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or(StockError::ReservationNotFound(reservation_id))?;

        match reservation.state {
            ReservationState::Confirmed => Ok(reservation.quantity),
            ReservationState::Released | ReservationState::Expired => {
                Err(StockError::ReservationInvalid {
                    reservation_id,
                    state: reservation.state,
                })
            },
            ReservationState::Active => {
                let quantity = reservation.quantity;
                reservation.state = ReservationState::Confirmed;
                self.stock.reserved = self.stock.reserved.checked_sub(quantity)?;
                self.stock.total = self.stock.total.checked_sub(quantity)?;
                self.version = self.version.next();
                Ok(quantity)
            },
        }
    }

    /// Return an `Active` reservation's quantity to `available`.
    ///
    /// Releasing an already `Released` or `Expired` reservation is a no-op
    /// success.
    ///
    /// # Errors
    ///
    /// [`StockError::ReservationNotFound`] for an unknown id;
    /// [`StockError::AlreadyConfirmed`] when the stock has already been
    /// deducted.
    pub fn release(
        &mut self,
        reservation_id: ReservationId,
        _reason: ReleaseReason,
    ) -> Result<Quantity, StockError> {
        let reservation = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or(StockError::ReservationNotFound(reservation_id))?;

        match reservation.state {
            ReservationState::Released | ReservationState::Expired => Ok(reservation.quantity),
            ReservationState::Confirmed => Err(StockError::AlreadyConfirmed(reservation_id)),
            ReservationState::Active => {
                let quantity = reservation.quantity;
                reservation.state = ReservationState::Released;
                self.stock.reserved = self.stock.reserved.checked_sub(quantity)?;
                self.stock.available = self.stock.available.checked_add(quantity)?;
                self.version = self.version.next();
                Ok(quantity)
            },
        }
    }

    /// Apply a direct inbound/loss/correction adjustment to available stock.
    ///
    /// Positive deltas add to both `total` and `available`; negative deltas
    /// remove from both and fail when `available` cannot cover them
    /// (reserved stock is never adjusted away).
    ///
    /// # Errors
    ///
    /// [`StockError::Arithmetic`] when the result would violate the ledger
    /// invariants; the aggregate is untouched on error.
    pub fn adjust(&mut self, delta: i64, _reason: &str) -> Result<(), StockError> {
        let magnitude = Quantity::new(delta.unsigned_abs());
        if delta >= 0 {
            let total = self.stock.total.checked_add(magnitude)?;
            let available = self.stock.available.checked_add(magnitude)?;
            self.stock.total = total;
            self.stock.available = available;
        } else {
            let available = self.stock.available.checked_sub(magnitude)?;
            let total = self.stock.total.checked_sub(magnitude)?;
            self.stock.total = total;
            self.stock.available = available;
        }
        self.version = self.version.next();
        Ok(())
    }

    /// Expire every `Active` reservation with `expires_at <= now`, returning
    /// their quantities to `available`.
    ///
    /// Returns the expired reservations as `(id, order, quantity)` so the
    /// caller can publish one release event per reservation. Bumps the
    /// version once if anything changed.
    pub fn sweep_expired(
        &mut self,
        now: DateTime<Utc>,
    ) -> Vec<(ReservationId, OrderId, Quantity)> {
        let mut swept = Vec::new();
        for reservation in self.reservations.values_mut() {
            if reservation.is_expired(now) {
                reservation.state = ReservationState::Expired;
                swept.push((
                    reservation.reservation_id,
                    reservation.order_id,
                    reservation.quantity,
                ));
            }
        }

        for (_, _, quantity) in &swept {
            // The subtractions cannot fail: every swept quantity is counted
            // in `reserved` by invariant 3.
            if let Ok(reserved) = self.stock.reserved.checked_sub(*quantity) {
                self.stock.reserved = reserved;
            }
            if let Ok(available) = self.stock.available.checked_add(*quantity) {
                self.stock.available = available;
            }
        }

        if !swept.is_empty() {
            self.version = self.version.next();
        }
        swept
    }

    /// Drop terminal reservations from the in-memory map, keeping the
    /// aggregate compact on long-lived products. Active reservations are
    /// never touched.
    pub fn compact_terminal_reservations(&mut self) {
        self.reservations.retain(|_, r| !r.state.is_terminal());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn product_with(total: u64) -> Product {
        Product::new(
            ProductId::new(),
            "Widget",
            Quantity::new(total),
            Quantity::new(5),
        )
    }

    fn assert_invariants(product: &Product) {
        let stock = product.stock();
        assert_eq!(
            stock.total,
            stock.available.checked_add(stock.reserved).unwrap(),
            "total = available + reserved"
        );
        let active_sum: u64 = product
            .reservations()
            .filter(|r| r.state == ReservationState::Active)
            .map(|r| r.quantity.value())
            .sum();
        assert_eq!(stock.reserved.value(), active_sum, "reserved = sum(active)");
    }

    #[test]
    fn reserve_moves_available_to_reserved() {
        let mut product = product_with(100);
        let before = product.version();

        let reservation = product
            .reserve(OrderId::new(), Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();

        assert_eq!(reservation.state, ReservationState::Active);
        assert_eq!(reservation.warehouse_id, DEFAULT_WAREHOUSE);
        assert_eq!(reservation.expires_at, fixed_now() + Duration::minutes(30));
        assert_eq!(product.stock().available, Quantity::new(97));
        assert_eq!(product.stock().reserved, Quantity::new(3));
        assert_eq!(product.stock().total, Quantity::new(100));
        assert!(product.version() > before);
        assert_invariants(&product);
    }

    #[test]
    fn reserve_rejects_zero_quantity() {
        let mut product = product_with(10);
        let result = product.reserve(
            OrderId::new(),
            Quantity::ZERO,
            Duration::minutes(30),
            fixed_now(),
        );
        assert_eq!(result, Err(StockError::ZeroQuantity));
    }

    #[test]
    fn reserve_rejects_insufficient_stock() {
        let mut product = product_with(2);
        let before = product.clone();

        let result = product.reserve(
            OrderId::new(),
            Quantity::new(3),
            Duration::minutes(30),
            fixed_now(),
        );

        assert_eq!(
            result,
            Err(StockError::InsufficientStock {
                requested: Quantity::new(3),
                available: Quantity::new(2),
            })
        );
        assert_eq!(product, before, "failed reserve must not mutate");
    }

    #[test]
    fn reserve_rejects_inactive_product() {
        let mut product = product_with(10);
        product.set_active(false);
        let result = product.reserve(
            OrderId::new(),
            Quantity::new(1),
            Duration::minutes(30),
            fixed_now(),
        );
        assert!(matches!(result, Err(StockError::ProductInactive(_))));
    }

    #[test]
    fn repeat_reserve_for_same_order_returns_existing_claim() {
        let mut product = product_with(10);
        let order_id = OrderId::new();

        let first = product
            .reserve(order_id, Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();
        let version = product.version();

        let second = product
            .reserve(order_id, Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();

        assert_eq!(first.reservation_id, second.reservation_id);
        assert_eq!(product.version(), version, "no-op must not bump");
        assert_eq!(product.stock().reserved, Quantity::new(3));
        assert_invariants(&product);
    }

    #[test]
    fn confirm_deducts_from_total_and_reserved() {
        let mut product = product_with(100);
        let reservation = product
            .reserve(OrderId::new(), Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();

        let quantity = product.confirm(reservation.reservation_id).unwrap();

        assert_eq!(quantity, Quantity::new(3));
        assert_eq!(product.stock().total, Quantity::new(97));
        assert_eq!(product.stock().available, Quantity::new(97));
        assert_eq!(product.stock().reserved, Quantity::ZERO);
        assert_eq!(
            product.reservation(reservation.reservation_id).unwrap().state,
            ReservationState::Confirmed
        );
        assert_invariants(&product);
    }

    #[test]
    fn confirm_is_idempotent_on_confirmed() {
        let mut product = product_with(100);
        let reservation = product
            .reserve(OrderId::new(), Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();
        product.confirm(reservation.reservation_id).unwrap();
        let version_after_first = product.version();

        let second = product.confirm(reservation.reservation_id).unwrap();

        assert_eq!(second, Quantity::new(3));
        assert_eq!(product.version(), version_after_first, "no-op must not bump");
        assert_eq!(product.stock().total, Quantity::new(97));
    }

    #[test]
    fn confirm_fails_on_released() {
        let mut product = product_with(100);
        let reservation = product
            .reserve(OrderId::new(), Quantity::new(3), Duration::minutes(30), fixed_now())
            .unwrap();
        product
            .release(reservation.reservation_id, ReleaseReason::OrderCancelled)
            .unwrap();

        let result = product.confirm(reservation.reservation_id);
        assert!(matches!(
            result,
            Err(StockError::ReservationInvalid { state: ReservationState::Released, .. })
        ));
    }

    #[test]
    fn release_returns_stock_to_available() {
        let mut product = product_with(10);
        let reservation = product
            .reserve(OrderId::new(), Quantity::new(4), Duration::minutes(30), fixed_now())
            .unwrap();

        product
            .release(reservation.reservation_id, ReleaseReason::PaymentFailed)
            .unwrap();

        assert_eq!(product.stock().available, Quantity::new(10));
        assert_eq!(product.stock().reserved, Quantity::ZERO);
        assert_eq!(product.stock().total, Quantity::new(10));
        assert_invariants(&product);
    }

    #[test]
    fn release_is_idempotent_and_rejects_confirmed() {
        let mut product = product_with(10);
        let r1 = product
            .reserve(OrderId::new(), Quantity::new(2), Duration::minutes(30), fixed_now())
            .unwrap();
        let r2 = product
            .reserve(OrderId::new(), Quantity::new(2), Duration::minutes(30), fixed_now())
            .unwrap();

        product
            .release(r1.reservation_id, ReleaseReason::OrderCancelled)
            .unwrap();
        // Second release of the same reservation: no-op success.
        assert_eq!(
            product
                .release(r1.reservation_id, ReleaseReason::OrderCancelled)
                .unwrap(),
            Quantity::new(2)
        );

        product.confirm(r2.reservation_id).unwrap();
        assert_eq!(
            product.release(r2.reservation_id, ReleaseReason::SystemError),
            Err(StockError::AlreadyConfirmed(r2.reservation_id))
        );
    }

    #[test]
    fn reserve_then_release_restores_prior_state_modulo_version() {
        let mut product = product_with(50);
        let before = product.stock();

        let reservation = product
            .reserve(OrderId::new(), Quantity::new(7), Duration::minutes(30), fixed_now())
            .unwrap();
        product
            .release(reservation.reservation_id, ReleaseReason::OrderCancelled)
            .unwrap();

        assert_eq!(product.stock(), before);
    }

    #[test]
    fn adjust_moves_total_and_available_together() {
        let mut product = product_with(10);
        product.adjust(5, "inbound delivery").unwrap();
        assert_eq!(product.stock().total, Quantity::new(15));
        assert_eq!(product.stock().available, Quantity::new(15));

        product.adjust(-3, "damaged goods").unwrap();
        assert_eq!(product.stock().total, Quantity::new(12));
        assert_eq!(product.stock().available, Quantity::new(12));
        assert_invariants(&product);
    }

    #[test]
    fn adjust_cannot_remove_reserved_stock() {
        let mut product = product_with(10);
        product
            .reserve(OrderId::new(), Quantity::new(8), Duration::minutes(30), fixed_now())
            .unwrap();

        // Only 2 available; removing 5 would eat into reserved units.
        let result = product.adjust(-5, "shrinkage");
        assert!(matches!(result, Err(StockError::Arithmetic(_))));
        assert_eq!(product.stock().reserved, Quantity::new(8));
        assert_invariants(&product);
    }

    #[test]
    fn sweep_expires_only_lapsed_reservations() {
        let mut product = product_with(20);
        let now = fixed_now();
        let lapsed = product
            .reserve(OrderId::new(), Quantity::new(5), Duration::seconds(1), now)
            .unwrap();
        let live = product
            .reserve(OrderId::new(), Quantity::new(4), Duration::minutes(30), now)
            .unwrap();

        let swept = product.sweep_expired(now + Duration::seconds(90));

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, lapsed.reservation_id);
        assert_eq!(swept[0].2, Quantity::new(5));
        assert_eq!(
            product.reservation(lapsed.reservation_id).unwrap().state,
            ReservationState::Expired
        );
        assert_eq!(
            product.reservation(live.reservation_id).unwrap().state,
            ReservationState::Active
        );
        assert_eq!(product.stock().available, Quantity::new(16));
        assert_eq!(product.stock().reserved, Quantity::new(4));
        assert_invariants(&product);
    }

    #[test]
    fn low_stock_signal_tracks_threshold() {
        let mut product = product_with(6);
        assert!(!product.is_low_stock());

        product
            .reserve(OrderId::new(), Quantity::new(2), Duration::minutes(30), fixed_now())
            .unwrap();
        // available = 4 <= threshold 5
        assert!(product.is_low_stock());
    }

    #[test]
    fn compact_drops_only_terminal_reservations() {
        let mut product = product_with(10);
        let done = product
            .reserve(OrderId::new(), Quantity::new(2), Duration::minutes(30), fixed_now())
            .unwrap();
        let open = product
            .reserve(OrderId::new(), Quantity::new(2), Duration::minutes(30), fixed_now())
            .unwrap();
        product.confirm(done.reservation_id).unwrap();

        product.compact_terminal_reservations();

        assert!(product.reservation(done.reservation_id).is_none());
        assert!(product.reservation(open.reservation_id).is_some());
    }

    proptest! {
        // Invariants 1-3 hold under arbitrary interleavings of reserve,
        // confirm, release, and sweep.
        #[test]
        fn prop_ledger_conservation(ops in proptest::collection::vec(0_u8..4, 1..40)) {
            let mut product = product_with(1000);
            let now = fixed_now();
            let mut open: Vec<ReservationId> = Vec::new();

            for (i, op) in ops.iter().enumerate() {
                match op {
                    0 => {
                        if let Ok(r) = product.reserve(
                            OrderId::new(),
                            Quantity::new((i as u64 % 9) + 1),
                            Duration::seconds(if i % 3 == 0 { 1 } else { 3600 }),
                            now,
                        ) {
                            open.push(r.reservation_id);
                        }
                    }
                    1 => {
                        if let Some(id) = open.pop() {
                            let _ = product.confirm(id);
                        }
                    }
                    2 => {
                        if let Some(id) = open.pop() {
                            let _ = product.release(id, ReleaseReason::OrderCancelled);
                        }
                    }
                    _ => {
                        product.sweep_expired(now + Duration::seconds(60));
                        open.clear();
                    }
                }

                let stock = product.stock();
                prop_assert_eq!(
                    stock.total,
                    stock.available.checked_add(stock.reserved).unwrap()
                );
                let active_sum: u64 = product
                    .reservations()
                    .filter(|r| r.state == ReservationState::Active)
                    .map(|r| r.quantity.value())
                    .sum();
                prop_assert_eq!(stock.reserved.value(), active_sum);
            }
        }
    }
}
