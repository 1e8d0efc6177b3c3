//! The stock service.
//!
//! Every mutation of a product runs the same pipeline: acquire the
//! product's distributed lock, load the aggregate, mutate in memory,
//! persist with an optimistic version check, then publish the resulting
//! events and refresh the caches. A lost version check under contention is
//! retried locally (bounded, jittered) before surfacing as a conflict.
//!
//! Reads go cache-first and fall through to the repository; a cache problem
//! is never fatal. Locks are held for the minimum span — never across the
//! event publish or any external call.

use crate::InventoryError;
use chrono::{DateTime, Utc};
use ordermesh_core::config::ReservationConfig;
use ordermesh_core::events::{
    EventPayload, LowStockAlert, LowStockItem, StockDeducted, StockItem, StockReleased,
    StockReserved,
};
use ordermesh_core::ids::{CorrelationId, OrderId, ProductId, ReservationId};
use ordermesh_core::order::ActorType;
use ordermesh_core::ports::{Clock, ProductRepository};
use ordermesh_core::quantity::Quantity;
use ordermesh_core::product::{
    Product, ReleaseReason, Reservation, ReservationState, StockError, StockLevels,
    DEFAULT_WAREHOUSE,
};
use ordermesh_core::EventEnvelope;
use ordermesh_runtime::cache::{product_key, stock_key, Cache, CacheRead, Invalidation};
use ordermesh_runtime::lock::LockHandle;
use ordermesh_runtime::publisher::ReliablePublisher;
use ordermesh_runtime::retry::{retry_classified, RetryPolicy};
use ordermesh_runtime::{InvalidationBus, LockService};
use std::sync::Arc;

/// The service name stamped on published envelopes.
pub const SOURCE_SERVICE: &str = "inventory-service";

/// One line of a batch reservation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReserveLine {
    /// The product to reserve from.
    pub product_id: ProductId,
    /// Units requested.
    pub quantity: Quantity,
}

/// The inventory context's application service.
pub struct StockService {
    products: Arc<dyn ProductRepository>,
    locks: LockService,
    publisher: Arc<ReliablePublisher>,
    clock: Arc<dyn Clock>,
    product_cache: Arc<Cache<Product>>,
    stock_cache: Arc<Cache<StockLevels>>,
    invalidations: Arc<InvalidationBus>,
    reservations: ReservationConfig,
    conflict_retry: RetryPolicy,
}

/// The outcome of one locked mutation.
struct Mutated<T> {
    value: T,
    product: Product,
    /// False when the mutation was an idempotent no-op; no events are
    /// published for no-ops.
    changed: bool,
}

impl StockService {
    /// Wire the service to its process-level resources.
    #[allow(clippy::too_many_arguments)] // Boot wiring names every resource once
    #[must_use]
    pub fn new(
        products: Arc<dyn ProductRepository>,
        locks: LockService,
        publisher: Arc<ReliablePublisher>,
        clock: Arc<dyn Clock>,
        product_cache: Arc<Cache<Product>>,
        stock_cache: Arc<Cache<StockLevels>>,
        invalidations: Arc<InvalidationBus>,
        reservations: ReservationConfig,
    ) -> Self {
        Self {
            products,
            locks,
            publisher,
            clock,
            product_cache,
            stock_cache,
            invalidations,
            reservations,
            conflict_retry: RetryPolicy::default(),
        }
    }

    /// Override the conflict retry policy (tests use tight delays).
    #[must_use]
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    /// Reserve stock for one order line. Idempotent per `(order, product,
    /// quantity)`: a re-delivered request returns the existing reservation
    /// without claiming twice.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] wrapping the stock, lock, or repository failure.
    pub async fn reserve(
        &self,
        product_id: ProductId,
        order_id: OrderId,
        quantity: Quantity,
        correlation_id: CorrelationId,
    ) -> Result<Reservation, InventoryError> {
        let ttl = self.reservations.ttl();
        let outcome = self
            .mutate_locked(product_id, move |product, now| {
                product.reserve(order_id, quantity, ttl, now)
            })
            .await?;

        if outcome.changed {
            self.publish_reserved(&outcome.product, &outcome.value, correlation_id)
                .await;
            self.maybe_alert_low_stock(&outcome.product, correlation_id)
                .await;
        }
        Ok(outcome.value)
    }

    /// Reserve several lines atomically: either every line is reserved or
    /// none is. Locks are taken in ascending product-id order; on any line
    /// failure every reservation already taken is released before the
    /// error surfaces.
    ///
    /// # Errors
    ///
    /// The first line failure encountered.
    pub async fn reserve_batch(
        &self,
        lines: &[ReserveLine],
        order_id: OrderId,
        correlation_id: CorrelationId,
    ) -> Result<Vec<Reservation>, InventoryError> {
        let mut sorted: Vec<ReserveLine> = lines.to_vec();
        sorted.sort_by_key(|line| *line.product_id.as_uuid());

        let keys: Vec<String> = sorted.iter().map(|l| l.product_id.to_string()).collect();
        let guards = self
            .locks
            .acquire_many(&keys, self.locks_wait(), self.locks_lease())
            .await?;

        let ttl = self.reservations.ttl();
        let mut taken: Vec<(Product, Reservation, bool)> = Vec::with_capacity(sorted.len());
        let mut failure: Option<InventoryError> = None;

        for line in &sorted {
            let quantity = line.quantity;
            match self
                .mutate_loaded(line.product_id, move |product, now| {
                    product.reserve(order_id, quantity, ttl, now)
                })
                .await
            {
                Ok(outcome) => taken.push((outcome.product, outcome.value, outcome.changed)),
                Err(err) => {
                    failure = Some(err);
                    break;
                },
            }
        }

        if let Some(err) = failure {
            // Compensate in reverse order while the locks are still held.
            for (product, reservation, _) in taken.into_iter().rev() {
                let reservation_id = reservation.reservation_id;
                if let Err(release_err) = self
                    .mutate_loaded(product.product_id(), move |p, _| {
                        p.release(reservation_id, ReleaseReason::SystemError)
                    })
                    .await
                {
                    tracing::error!(
                        product_id = %product.product_id(),
                        reservation_id = %reservation_id,
                        error = %release_err,
                        "Failed to roll back reservation from aborted batch"
                    );
                }
            }
            drop(guards);
            metrics::counter!("stock.batch_reserve_failed").increment(1);
            return Err(err);
        }

        drop(guards);

        let mut reservations = Vec::with_capacity(taken.len());
        for (product, reservation, changed) in taken {
            if changed {
                self.publish_reserved(&product, &reservation, correlation_id)
                    .await;
                self.maybe_alert_low_stock(&product, correlation_id).await;
            }
            reservations.push(reservation);
        }
        Ok(reservations)
    }

    /// Convert a reservation to a deduction (the stock leaves the ledger).
    /// Idempotent: confirming an already-confirmed reservation succeeds
    /// without publishing a second deduction.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] wrapping the stock, lock, or repository failure.
    pub async fn confirm(
        &self,
        product_id: ProductId,
        reservation_id: ReservationId,
        correlation_id: CorrelationId,
    ) -> Result<(), InventoryError> {
        let outcome = self
            .mutate_locked(product_id, move |product, _| product.confirm(reservation_id))
            .await?;

        if outcome.changed {
            let quantity = outcome.value;
            let Some(order_id) = outcome
                .product
                .reservation(reservation_id)
                .map(|r| r.order_id)
            else {
                tracing::error!(
                    reservation_id = %reservation_id,
                    "Confirmed reservation vanished before publish"
                );
                return Ok(());
            };
            let deducted = StockDeducted {
                inventory_id: product_id,
                reservation_id,
                order_id,
                items: vec![StockItem {
                    product_id,
                    quantity,
                    warehouse_id: DEFAULT_WAREHOUSE.to_string(),
                }],
                deducted_at: self.clock.now(),
            };
            self.publish(
                EventPayload::StockDeducted(deducted),
                &outcome.product,
                correlation_id,
            )
            .await;
            self.maybe_alert_low_stock(&outcome.product, correlation_id)
                .await;
        }
        Ok(())
    }

    /// Return a reservation's stock to availability. Idempotent on
    /// already-released reservations.
    ///
    /// # Errors
    ///
    /// [`InventoryError`]; releasing a confirmed reservation fails with
    /// [`StockError::AlreadyConfirmed`].
    pub async fn release(
        &self,
        product_id: ProductId,
        reservation_id: ReservationId,
        reason: ReleaseReason,
        released_by: &str,
        released_by_type: ActorType,
        correlation_id: CorrelationId,
    ) -> Result<(), InventoryError> {
        let outcome = self
            .mutate_locked(product_id, move |product, _| {
                product.release(reservation_id, reason)
            })
            .await?;

        if outcome.changed {
            let Some(order_id) = outcome
                .product
                .reservation(reservation_id)
                .map(|r| r.order_id)
            else {
                tracing::error!(
                    reservation_id = %reservation_id,
                    "Released reservation vanished before publish"
                );
                return Ok(());
            };
            let released = StockReleased {
                inventory_id: product_id,
                reservation_id,
                order_id,
                release_reason: reason,
                items: vec![StockItem {
                    product_id,
                    quantity: outcome.value,
                    warehouse_id: DEFAULT_WAREHOUSE.to_string(),
                }],
                released_by: released_by.to_string(),
                released_by_type,
            };
            self.publish(
                EventPayload::StockReleased(released),
                &outcome.product,
                correlation_id,
            )
            .await;
        }
        Ok(())
    }

    /// Release every still-active reservation a product holds for an
    /// order. Used by compensation when an order is cancelled or its
    /// payment fails.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] from the lock/load/save pipeline.
    pub async fn release_for_order(
        &self,
        product_id: ProductId,
        order_id: OrderId,
        reason: ReleaseReason,
        released_by: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), InventoryError> {
        let product = self.products.load(product_id).await?;
        let to_release: Vec<ReservationId> = product
            .reservations()
            .filter(|r| {
                r.order_id == order_id
                    && r.state == ReservationState::Active
            })
            .map(|r| r.reservation_id)
            .collect();

        for reservation_id in to_release {
            self.release(
                product_id,
                reservation_id,
                reason,
                released_by,
                ActorType::System,
                correlation_id,
            )
            .await?;
        }
        Ok(())
    }

    /// Apply a direct stock correction.
    ///
    /// # Errors
    ///
    /// [`InventoryError`]; corrections that would eat into reserved stock
    /// fail validation.
    pub async fn adjust(
        &self,
        product_id: ProductId,
        delta: i64,
        reason: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), InventoryError> {
        let reason_owned = reason.to_string();
        let outcome = self
            .mutate_locked(product_id, move |product, _| {
                product.adjust(delta, &reason_owned)
            })
            .await?;
        if outcome.changed {
            self.maybe_alert_low_stock(&outcome.product, correlation_id)
                .await;
        }
        Ok(())
    }

    /// Expire every lapsed reservation on a product, publishing one
    /// `StockReleased(EXPIRED)` per reservation. Returns the expired
    /// reservation ids.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] from the lock/load/save pipeline.
    pub async fn sweep_expired(
        &self,
        product_id: ProductId,
        correlation_id: CorrelationId,
    ) -> Result<Vec<ReservationId>, InventoryError> {
        let outcome = self
            .mutate_locked(product_id, |product, now| {
                Ok::<_, StockError>(product.sweep_expired(now))
            })
            .await?;

        let mut swept_ids = Vec::with_capacity(outcome.value.len());
        for (reservation_id, order_id, quantity) in outcome.value {
            let released = StockReleased {
                inventory_id: product_id,
                reservation_id,
                order_id,
                release_reason: ReleaseReason::Expired,
                items: vec![StockItem {
                    product_id,
                    quantity,
                    warehouse_id: DEFAULT_WAREHOUSE.to_string(),
                }],
                released_by: "reservation-expirer".to_string(),
                released_by_type: ActorType::System,
            };
            self.publish(
                EventPayload::StockReleased(released),
                &outcome.product,
                correlation_id,
            )
            .await;
            swept_ids.push(reservation_id);
        }
        Ok(swept_ids)
    }

    /// Read a product's stock counters, cache-first.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] when the authoritative load fails on a cache
    /// miss.
    pub async fn stock_levels(&self, product_id: ProductId) -> Result<StockLevels, InventoryError> {
        let key = stock_key(&product_id);
        match self.stock_cache.get(&key) {
            CacheRead::Hit {
                value,
                needs_refresh,
            } => {
                if needs_refresh {
                    self.spawn_stock_refresh(product_id);
                }
                Ok(value)
            },
            CacheRead::Miss => {
                let product = self.products.load(product_id).await?;
                self.stock_cache
                    .put_versioned(&key, product.stock(), product.version().value());
                Ok(product.stock())
            },
        }
    }

    /// Read a product aggregate, cache-first.
    ///
    /// # Errors
    ///
    /// [`InventoryError`] when the authoritative load fails on a cache
    /// miss.
    pub async fn product(&self, product_id: ProductId) -> Result<Product, InventoryError> {
        let key = product_key(&product_id);
        match self.product_cache.get(&key) {
            CacheRead::Hit { value, .. } => Ok(value),
            CacheRead::Miss => {
                let product = self.products.load(product_id).await?;
                self.product_cache
                    .put_versioned(&key, product.clone(), product.version().value());
                Ok(product)
            },
        }
    }

    // ===== Pipeline internals =====

    const fn locks_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(3)
    }

    const fn locks_lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }

    /// Full pipeline: lock, then load-mutate-save with conflict retry.
    async fn mutate_locked<T, F>(
        &self,
        product_id: ProductId,
        mutate: F,
    ) -> Result<Mutated<T>, InventoryError>
    where
        F: Fn(&mut Product, DateTime<Utc>) -> Result<T, StockError>,
    {
        let guard: LockHandle = self.locks.acquire(&product_id.to_string()).await?;
        let result = self.mutate_loaded(product_id, mutate).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(product_id = %product_id, error = %e, "Lock release failed");
        }
        result
    }

    /// Load-mutate-save under an already-held lock, retrying lost
    /// optimistic checks.
    async fn mutate_loaded<T, F>(
        &self,
        product_id: ProductId,
        mutate: F,
    ) -> Result<Mutated<T>, InventoryError>
    where
        F: Fn(&mut Product, DateTime<Utc>) -> Result<T, StockError>,
    {
        let outcome = retry_classified(&self.conflict_retry, || async {
            let mut product = self.products.load(product_id).await?;
            let expected = product.version();
            let now = self.clock.now();

            let value = mutate(&mut product, now).map_err(InventoryError::Stock)?;
            let changed = product.version() != expected;

            if changed {
                self.products.save(&product, expected).await?;
            }
            Ok::<_, InventoryError>(Mutated {
                value,
                product,
                changed,
            })
        })
        .await?;

        if outcome.changed {
            self.refresh_caches(&outcome.product);
        }
        Ok(outcome)
    }

    /// Write-through both caches and tell peers to evict.
    fn refresh_caches(&self, product: &Product) {
        let version = product.version().value();
        let pkey = product_key(&product.product_id());
        let skey = stock_key(&product.product_id());
        self.product_cache
            .put_versioned(&pkey, product.clone(), version);
        self.stock_cache.put_versioned(&skey, product.stock(), version);
        self.invalidations.broadcast(Invalidation::Multi {
            keys: vec![pkey, skey],
        });
    }

    fn spawn_stock_refresh(&self, product_id: ProductId) {
        let products = Arc::clone(&self.products);
        let cache = Arc::clone(&self.stock_cache);
        tokio::spawn(async move {
            match products.load(product_id).await {
                Ok(product) => {
                    cache.put_versioned(
                        &stock_key(&product_id),
                        product.stock(),
                        product.version().value(),
                    );
                },
                Err(e) => {
                    tracing::debug!(product_id = %product_id, error = %e, "Async cache refresh failed");
                },
            }
        });
    }

    async fn publish_reserved(
        &self,
        product: &Product,
        reservation: &Reservation,
        correlation_id: CorrelationId,
    ) {
        let reserved = StockReserved {
            inventory_id: product.product_id(),
            reservation_id: reservation.reservation_id,
            order_id: reservation.order_id,
            items: vec![StockItem {
                product_id: product.product_id(),
                quantity: reservation.quantity,
                warehouse_id: reservation.warehouse_id.clone(),
            }],
            expires_at: reservation.expires_at,
        };
        self.publish(EventPayload::StockReserved(reserved), product, correlation_id)
            .await;
    }

    async fn maybe_alert_low_stock(&self, product: &Product, correlation_id: CorrelationId) {
        if !product.is_low_stock() {
            return;
        }
        let alert = LowStockAlert {
            inventory_id: product.product_id(),
            alert_level: if product.stock().available.is_zero() {
                "CRITICAL".to_string()
            } else {
                "WARNING".to_string()
            },
            low_stock_items: vec![LowStockItem {
                product_id: product.product_id(),
                available: product.stock().available,
                threshold: product.low_stock_threshold(),
            }],
        };
        // Fire-and-forget: an unsent alert never fails the mutation.
        self.publish(EventPayload::LowStockAlert(alert), product, correlation_id)
            .await;
    }

    /// Publish after commit. The aggregate state is authoritative by now,
    /// so a failed publish is logged (and dead-lettered by the reliable
    /// publisher) rather than unwinding the mutation.
    async fn publish(
        &self,
        payload: EventPayload,
        product: &Product,
        correlation_id: CorrelationId,
    ) {
        let envelope = EventEnvelope::new(
            payload,
            product.version(),
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
