//! The processed-event log.
//!
//! One row per `(consumer, event_id)` with an atomic insert-if-absent:
//!
//! ```sql
//! CREATE TABLE processed_events (
//!     consumer     TEXT NOT NULL,
//!     event_id     UUID NOT NULL,
//!     aggregate_id TEXT NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (consumer, event_id)
//! );
//! ```
//!
//! `ON CONFLICT DO NOTHING` makes the mark race-free: of two concurrent
//! deliveries exactly one observes `true` from [`ProcessedEventLog::mark_if_new`].

use ordermesh_core::ids::EventId;
use ordermesh_core::ports::{PortFuture, ProcessedEventLog, ProcessedLogError};
use sqlx::PgPool;

/// PostgreSQL-backed processed-event log.
pub struct PgProcessedEventLog {
    pool: PgPool,
}

impl PgProcessedEventLog {
    /// Create a log over a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ProcessedEventLog for PgProcessedEventLog {
    fn already_processed(
        &self,
        consumer: &str,
        event_id: EventId,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
        let consumer = consumer.to_string();
        Box::pin(async move {
            let exists: bool = sqlx::query_scalar(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM processed_events
                    WHERE consumer = $1 AND event_id = $2
                )
                ",
            )
            .bind(&consumer)
            .bind(event_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProcessedLogError(e.to_string()))?;
            Ok(exists)
        })
    }

    fn mark_if_new(
        &self,
        consumer: &str,
        event_id: EventId,
        aggregate_id: &str,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
        let consumer = consumer.to_string();
        let aggregate_id = aggregate_id.to_string();
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO processed_events (consumer, event_id, aggregate_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (consumer, event_id) DO NOTHING
                ",
            )
            .bind(&consumer)
            .bind(event_id.as_uuid())
            .bind(&aggregate_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ProcessedLogError(e.to_string()))?;

            Ok(result.rows_affected() == 1)
        })
    }
}
