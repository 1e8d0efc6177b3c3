//! Product aggregate persistence.
//!
//! Maps the product aggregate onto two tables loaded and stored as one
//! unit inside a transaction — no lazy edges ever cross a transaction
//! boundary:
//!
//! ```sql
//! CREATE TABLE products (
//!     product_id          UUID PRIMARY KEY,
//!     name                TEXT NOT NULL,
//!     status              TEXT NOT NULL,      -- ACTIVE | INACTIVE
//!     category            TEXT,               -- kept for future use
//!     total_quantity      BIGINT NOT NULL,
//!     available_quantity  BIGINT NOT NULL,
//!     reserved_quantity   BIGINT NOT NULL,
//!     low_stock_threshold BIGINT NOT NULL,
//!     version             BIGINT NOT NULL
//! );
//! CREATE INDEX idx_products_available ON products (available_quantity);
//! CREATE INDEX idx_products_status_category ON products (status, category);
//!
//! CREATE TABLE stock_reservations (
//!     reservation_id UUID PRIMARY KEY,
//!     product_id     UUID NOT NULL REFERENCES products (product_id),
//!     order_id       UUID NOT NULL,
//!     quantity       BIGINT NOT NULL,
//!     state          TEXT NOT NULL,
//!     warehouse_id   TEXT NOT NULL,
//!     created_at     TIMESTAMPTZ NOT NULL,
//!     expires_at     TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_reservations_product ON stock_reservations (product_id);
//! CREATE INDEX idx_reservations_order ON stock_reservations (order_id);
//! CREATE INDEX idx_reservations_expiry ON stock_reservations (state, expires_at);
//! ```
//!
//! Saves are conditional on the `version` column: `UPDATE … WHERE version =
//! $expected` touching zero rows means another writer committed first and
//! surfaces as a concurrency conflict for the caller to retry.

use chrono::{DateTime, Utc};
use ordermesh_core::ids::{OrderId, ProductId, ReservationId};
use ordermesh_core::ports::{PortFuture, ProductRepository, RepositoryError};
use ordermesh_core::product::{Product, Reservation, ReservationState, StockLevels};
use ordermesh_core::quantity::Quantity;
use ordermesh_core::version::Version;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL-backed product repository.
pub struct PgProductRepository {
    pool: PgPool,
}

impl PgProductRepository {
    /// Create a repository over a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn quantity_column(value: i64, column: &str) -> Result<Quantity, RepositoryError> {
        u64::try_from(value)
            .map(Quantity::new)
            .map_err(|_| RepositoryError::Mapping(format!("negative {column}: {value}")))
    }

    #[allow(clippy::cast_possible_wrap)] // Quantities are far below i64::MAX
    const fn quantity_param(quantity: Quantity) -> i64 {
        quantity.value() as i64
    }

    fn row_to_reservation(row: &sqlx::postgres::PgRow) -> Result<Reservation, RepositoryError> {
        let state_str: String = row.get("state");
        let state = ReservationState::parse(&state_str)
            .map_err(|s| RepositoryError::Mapping(format!("unknown reservation state: {s}")))?;
        Ok(Reservation {
            reservation_id: ReservationId::from_uuid(row.get::<Uuid, _>("reservation_id")),
            order_id: OrderId::from_uuid(row.get::<Uuid, _>("order_id")),
            quantity: Self::quantity_column(row.get("quantity"), "reservation quantity")?,
            state,
            warehouse_id: row.get("warehouse_id"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        })
    }

    async fn write_reservations(
        tx: &mut Transaction<'_, Postgres>,
        product: &Product,
    ) -> Result<(), RepositoryError> {
        // The aggregate owns the full reservation set: rewrite it wholesale
        // inside the same transaction as the counters.
        sqlx::query("DELETE FROM stock_reservations WHERE product_id = $1")
            .bind(product.product_id().as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

        for reservation in product.reservations() {
            sqlx::query(
                r"
                INSERT INTO stock_reservations (
                    reservation_id, product_id, order_id, quantity, state,
                    warehouse_id, created_at, expires_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(reservation.reservation_id.as_uuid())
            .bind(product.product_id().as_uuid())
            .bind(reservation.order_id.as_uuid())
            .bind(Self::quantity_param(reservation.quantity))
            .bind(reservation.state.as_str())
            .bind(&reservation.warehouse_id)
            .bind(reservation.created_at)
            .bind(reservation.expires_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}

impl ProductRepository for PgProductRepository {
    fn load(&self, product_id: ProductId) -> PortFuture<'_, Result<Product, RepositoryError>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let row = sqlx::query(
                r"
                SELECT name, status, total_quantity, available_quantity,
                       reserved_quantity, low_stock_threshold, version
                FROM products
                WHERE product_id = $1
                ",
            )
            .bind(product_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?
            .ok_or_else(|| RepositoryError::NotFound(format!("product {product_id}")))?;

            let reservation_rows = sqlx::query(
                r"
                SELECT reservation_id, order_id, quantity, state, warehouse_id,
                       created_at, expires_at
                FROM stock_reservations
                WHERE product_id = $1
                ",
            )
            .bind(product_id.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let reservations = reservation_rows
                .iter()
                .map(Self::row_to_reservation)
                .collect::<Result<Vec<_>, _>>()?;

            let status: String = row.get("status");
            let stock = StockLevels {
                total: Self::quantity_column(row.get("total_quantity"), "total_quantity")?,
                available: Self::quantity_column(
                    row.get("available_quantity"),
                    "available_quantity",
                )?,
                reserved: Self::quantity_column(
                    row.get("reserved_quantity"),
                    "reserved_quantity",
                )?,
            };

            Ok(Product::from_parts(
                product_id,
                row.get("name"),
                status == "ACTIVE",
                stock,
                reservations,
                Self::quantity_column(row.get("low_stock_threshold"), "low_stock_threshold")?,
                Version::new(
                    u64::try_from(row.get::<i64, _>("version")).map_err(|_| {
                        RepositoryError::Mapping("negative product version".to_string())
                    })?,
                ),
            ))
        })
    }

    fn insert(&self, product: &Product) -> PortFuture<'_, Result<(), RepositoryError>> {
        let product = product.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO products (
                    product_id, name, status, total_quantity, available_quantity,
                    reserved_quantity, low_stock_threshold, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(product.product_id().as_uuid())
            .bind(product.name())
            .bind(if product.is_active() { "ACTIVE" } else { "INACTIVE" })
            .bind(Self::quantity_param(product.stock().total))
            .bind(Self::quantity_param(product.stock().available))
            .bind(Self::quantity_param(product.stock().reserved))
            .bind(Self::quantity_param(product.low_stock_threshold()))
            .bind(i64::try_from(product.version().value()).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            Self::write_reservations(&mut tx, &product).await?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))
        })
    }

    fn save(
        &self,
        product: &Product,
        expected: Version,
    ) -> PortFuture<'_, Result<(), RepositoryError>> {
        let product = product.clone();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            let result = sqlx::query(
                r"
                UPDATE products
                SET name = $2,
                    status = $3,
                    total_quantity = $4,
                    available_quantity = $5,
                    reserved_quantity = $6,
                    low_stock_threshold = $7,
                    version = $8
                WHERE product_id = $1 AND version = $9
                ",
            )
            .bind(product.product_id().as_uuid())
            .bind(product.name())
            .bind(if product.is_active() { "ACTIVE" } else { "INACTIVE" })
            .bind(Self::quantity_param(product.stock().total))
            .bind(Self::quantity_param(product.stock().available))
            .bind(Self::quantity_param(product.stock().reserved))
            .bind(Self::quantity_param(product.low_stock_threshold()))
            .bind(i64::try_from(product.version().value()).unwrap_or(i64::MAX))
            .bind(i64::try_from(expected.value()).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            if result.rows_affected() == 0 {
                // Distinguish a lost race from a missing row.
                let current: Option<i64> =
                    sqlx::query_scalar("SELECT version FROM products WHERE product_id = $1")
                        .bind(product.product_id().as_uuid())
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| RepositoryError::Storage(e.to_string()))?;

                return match current {
                    Some(actual) => Err(RepositoryError::ConcurrencyConflict {
                        expected,
                        actual: Version::new(u64::try_from(actual).unwrap_or(0)),
                    }),
                    None => Err(RepositoryError::NotFound(format!(
                        "product {}",
                        product.product_id()
                    ))),
                };
            }

            Self::write_reservations(&mut tx, &product).await?;

            tx.commit()
                .await
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            metrics::counter!("repository.product_saved").increment(1);
            Ok(())
        })
    }

    fn products_with_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>> {
        Box::pin(async move {
            let rows: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT DISTINCT product_id
                FROM stock_reservations
                WHERE state = 'ACTIVE' AND expires_at <= $1
                ",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            Ok(rows.into_iter().map(ProductId::from_uuid).collect())
        })
    }

    fn products_with_reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>> {
        Box::pin(async move {
            let rows: Vec<Uuid> = sqlx::query_scalar(
                r"
                SELECT DISTINCT product_id
                FROM stock_reservations
                WHERE order_id = $1
                ",
            )
            .bind(order_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;

            Ok(rows.into_iter().map(ProductId::from_uuid).collect())
        })
    }
}
