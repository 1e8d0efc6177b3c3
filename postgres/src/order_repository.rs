//! Order aggregate persistence.
//!
//! Maps the order aggregate onto two tables loaded and stored as one unit:
//!
//! ```sql
//! CREATE TABLE orders (
//!     order_id            UUID PRIMARY KEY,
//!     customer_id         UUID NOT NULL,
//!     status              TEXT NOT NULL,
//!     total_amount        BIGINT NOT NULL,
//!     currency            TEXT NOT NULL,
//!     payment_id          UUID,
//!     cancel_reason       TEXT,
//!     cancelled_by        TEXT,
//!     cancelled_by_type   TEXT,
//!     paid_at             TIMESTAMPTZ,
//!     created_at          TIMESTAMPTZ NOT NULL,
//!     last_modified_at    TIMESTAMPTZ NOT NULL,
//!     content_hash        BIGINT NOT NULL,
//!     version             BIGINT NOT NULL
//! );
//! CREATE INDEX idx_orders_customer_created ON orders (customer_id, created_at DESC);
//! CREATE INDEX idx_orders_status ON orders (status);
//!
//! CREATE TABLE order_items (
//!     order_id       UUID NOT NULL REFERENCES orders (order_id),
//!     line_no        INT NOT NULL,
//!     product_id     UUID NOT NULL,
//!     product_name   TEXT NOT NULL,
//!     quantity       BIGINT NOT NULL,
//!     unit_price     BIGINT NOT NULL,
//!     currency       TEXT NOT NULL,
//!     line_total     BIGINT NOT NULL,
//!     reservation_id UUID,
//!     PRIMARY KEY (order_id, line_no)
//! );
//! ```
//!
//! The `content_hash` column backs the duplicate-order window query; it
//! stores the unsigned hash bit-cast to `BIGINT`.

use chrono::{DateTime, Utc};
use ordermesh_core::ids::{CustomerId, OrderId, PaymentId, ProductId, ReservationId};
use ordermesh_core::money::{Currency, Money};
use ordermesh_core::order::{ActorType, CancellationReason, Order, OrderItem, OrderStatus};
use ordermesh_core::ports::{OrderRepository, PortFuture, RepositoryError};
use ordermesh_core::quantity::Quantity;
use ordermesh_core::version::Version;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL-backed order repository.
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    /// Create a repository over a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::cast_possible_wrap)] // Bit-cast for storage, reversed on load
    const fn hash_param(hash: u64) -> i64 {
        hash as i64
    }

    #[allow(clippy::cast_sign_loss)] // Reverses the storage bit-cast
    const fn hash_column(raw: i64) -> u64 {
        raw as u64
    }

    fn currency_column(code: &str) -> Result<Currency, RepositoryError> {
        Currency::parse(code)
            .map_err(|e| RepositoryError::Mapping(format!("bad currency column: {e}")))
    }

    fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<OrderItem, RepositoryError> {
        let currency = Self::currency_column(&row.get::<String, _>("currency"))?;
        let quantity = u64::try_from(row.get::<i64, _>("quantity"))
            .map_err(|_| RepositoryError::Mapping("negative item quantity".to_string()))?;
        Ok(OrderItem {
            product_id: ProductId::from_uuid(row.get::<Uuid, _>("product_id")),
            product_name: row.get("product_name"),
            quantity: Quantity::new(quantity),
            unit_price: Money::from_minor_units(row.get("unit_price"), currency),
            line_total: Money::from_minor_units(row.get("line_total"), currency),
            reservation_id: row
                .get::<Option<Uuid>, _>("reservation_id")
                .map(ReservationId::from_uuid),
        })
    }

    fn row_to_cancellation(row: &sqlx::postgres::PgRow) -> Option<CancellationReason> {
        let reason: Option<String> = row.get("cancel_reason");
        let cancelled_by: Option<String> = row.get("cancelled_by");
        let by_type: Option<String> = row.get("cancelled_by_type");
        match (reason, cancelled_by, by_type) {
            (Some(reason), Some(cancelled_by), Some(by_type)) => Some(CancellationReason {
                reason,
                cancelled_by,
                cancelled_by_type: if by_type == "CUSTOMER" {
                    ActorType::Customer
                } else {
                    ActorType::System
                },
            }),
            _ => None,
        }
    }

    async fn write_items(
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(order.order_id().as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        for (line_no, item) in order.items().iter().enumerate() {
            sqlx::query(
                r"
                INSERT INTO order_items (
                    order_id, line_no, product_id, product_name, quantity,
                    unit_price, currency, line_total, reservation_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(order.order_id().as_uuid())
            .bind(i32::try_from(line_no).unwrap_or(i32::MAX))
            .bind(item.product_id.as_uuid())
            .bind(&item.product_name)
            .bind(i64::try_from(item.quantity.value()).unwrap_or(i64::MAX))
            .bind(item.unit_price.minor_units())
            .bind(item.unit_price.currency().as_str())
            .bind(item.line_total.minor_units())
            .bind(item.reservation_id.map(|id| *id.as_uuid()))
            .execute(&mut **tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    fn bind_order_columns<'q>(
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        order: &'q Order,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        query
            .bind(order.status().as_str())
            .bind(order.total_amount().minor_units())
            .bind(order.total_amount().currency().as_str().to_owned())
            .bind(order.payment_id().map(|id| *id.as_uuid()))
            .bind(order.cancellation_reason().map(|c| c.reason.clone()))
            .bind(order.cancellation_reason().map(|c| c.cancelled_by.clone()))
            .bind(order.cancellation_reason().map(|c| {
                match c.cancelled_by_type {
                    ActorType::Customer => "CUSTOMER",
                    ActorType::System => "SYSTEM",
                }
            }))
            .bind(order.paid_at())
            .bind(order.last_modified_at())
            .bind(i64::try_from(order.version().value()).unwrap_or(i64::MAX))
    }
}

impl OrderRepository for PgOrderRepository {
    fn load(&self, order_id: OrderId) -> PortFuture<'_, Result<Order, RepositoryError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let row = sqlx::query(
                r"
                SELECT customer_id, status, total_amount, currency, payment_id,
                       cancel_reason, cancelled_by, cancelled_by_type, paid_at,
                       created_at, last_modified_at, content_hash, version
                FROM orders
                WHERE order_id = $1
                ",
            )
            .bind(order_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?
            .ok_or_else(|| RepositoryError::NotFound(format!("order {order_id}")))?;

            let item_rows = sqlx::query(
                r"
                SELECT product_id, product_name, quantity, unit_price, currency,
                       line_total, reservation_id
                FROM order_items
                WHERE order_id = $1
                ORDER BY line_no
                ",
            )
            .bind(order_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let items = item_rows
                .iter()
                .map(Self::row_to_item)
                .collect::<Result<Vec<_>, _>>()?;

            let status_str: String = row.get("status");
            let status = OrderStatus::parse(&status_str)
                .map_err(|s| RepositoryError::Mapping(format!("unknown order status: {s}")))?;
            let currency = Self::currency_column(&row.get::<String, _>("currency"))?;

            Ok(Order::from_parts(
                order_id,
                CustomerId::from_uuid(row.get::<Uuid, _>("customer_id")),
                status,
                items,
                Money::from_minor_units(row.get("total_amount"), currency),
                row.get::<Option<Uuid>, _>("payment_id")
                    .map(PaymentId::from_uuid),
                Self::row_to_cancellation(&row),
                row.get("paid_at"),
                row.get("created_at"),
                row.get("last_modified_at"),
                Self::hash_column(row.get("content_hash")),
                Version::new(
                    u64::try_from(row.get::<i64, _>("version")).map_err(|_| {
                        RepositoryError::Mapping("negative order version".to_string())
                    })?,
                ),
            ))
        })
    }

    fn insert(&self, order: &Order) -> PortFuture<'_, Result<(), RepositoryError>> {
        let order = order.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let query = sqlx::query(
                r"
                INSERT INTO orders (
                    order_id, customer_id, created_at, content_hash,
                    status, total_amount, currency, payment_id,
                    cancel_reason, cancelled_by, cancelled_by_type,
                    paid_at, last_modified_at, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ",
            )
            .bind(*order.order_id().as_uuid())
            .bind(*order.customer_id().as_uuid())
            .bind(order.created_at())
            .bind(Self::hash_param(order.content_hash()));
            Self::bind_order_columns(query, &order)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            Self::write_items(&mut tx, &order).await?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))
        })
    }

    fn save(&self, order: &Order, expected: Version) -> PortFuture<'_, Result<(), RepositoryError>> {
        let order = order.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let query = sqlx::query(
                r"
                UPDATE orders
                SET status = $3,
                    total_amount = $4,
                    currency = $5,
                    payment_id = $6,
                    cancel_reason = $7,
                    cancelled_by = $8,
                    cancelled_by_type = $9,
                    paid_at = $10,
                    last_modified_at = $11,
                    version = $12
                WHERE order_id = $1 AND version = $2
                ",
            )
            .bind(*order.order_id().as_uuid())
            .bind(i64::try_from(expected.value()).unwrap_or(i64::MAX));
            let result = Self::bind_order_columns(query, &order)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            if result.rows_affected() == 0 {
                let current: Option<i64> =
                    sqlx::query_scalar("SELECT version FROM orders WHERE order_id = $1")
                        .bind(order.order_id().as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

                return match current {
                    Some(actual) => Err(RepositoryError::ConcurrencyConflict {
                        expected,
                        actual: Version::new(u64::try_from(actual).unwrap_or(0)),
                    }),
                    None => Err(RepositoryError::NotFound(format!(
                        "order {}",
                        order.order_id()
                    ))),
                };
            }

            Self::write_items(&mut tx, &order).await?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            metrics::counter!("repository.order_saved").increment(1);
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
            let row: Option<Uuid> = sqlx::query_scalar(
                r"
                SELECT order_id
                FROM orders
                WHERE customer_id = $1
                  AND content_hash = $2
                  AND created_at >= $3
                  AND status NOT IN ('COMPLETED', 'CANCELLED', 'REFUNDED', 'FAILED')
                ORDER BY created_at DESC
                LIMIT 1
                ",
            )
            .bind(customer_id.as_uuid())
            .bind(Self::hash_param(content_hash))
            .bind(window_start)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            Ok(row.map(OrderId::from_uuid))
        })
    }
}
