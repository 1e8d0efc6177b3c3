//! The dead-letter store.
//!
//! Durable home for events that exhausted their retries or hit a
//! non-retryable error, with the management surface incident response
//! needs: list, inspect, mark resolved, or discard.
//!
//! ```sql
//! CREATE TABLE dead_letters (
//!     id               BIGSERIAL PRIMARY KEY,
//!     event_id         UUID,
//!     event_type       TEXT,
//!     aggregate_id     TEXT,
//!     topic            TEXT NOT NULL,
//!     payload          BYTEA NOT NULL,
//!     error_message    TEXT NOT NULL,
//!     error_details    TEXT,
//!     retry_count      INT NOT NULL,
//!     status           TEXT NOT NULL DEFAULT 'pending',
//!     failed_at        TIMESTAMPTZ NOT NULL,
//!     resolved_at      TIMESTAMPTZ,
//!     resolved_by      TEXT,
//!     resolution_notes TEXT
//! );
//! CREATE INDEX idx_dead_letters_status ON dead_letters (status, failed_at);
//! ```

use chrono::{DateTime, Utc};
use ordermesh_core::ids::EventId;
use ordermesh_core::ports::{DeadLetter, DeadLetterError, DeadLetterSink, PortFuture};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the dead-letter management API.
#[derive(Error, Debug)]
pub enum DlqError {
    /// The database failed.
    #[error("Dead-letter store error: {0}")]
    Storage(String),

    /// An entry's stored status is not a known label.
    #[error("Invalid dead-letter status: {0}")]
    InvalidStatus(String),
}

/// Lifecycle of a dead-lettered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqStatus {
    /// Awaiting investigation or reprocessing.
    Pending,
    /// Someone is working on it.
    Processing,
    /// Successfully reprocessed.
    Resolved,
    /// Permanently discarded (cannot be fixed).
    Discarded,
}

impl DlqStatus {
    /// Database label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse a database label.
    ///
    /// # Errors
    ///
    /// [`DlqError::InvalidStatus`] for anything unrecognised.
    pub fn parse(s: &str) -> Result<Self, DlqError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            other => Err(DlqError::InvalidStatus(other.to_string())),
        }
    }
}

/// A stored dead letter plus its management metadata.
#[derive(Debug, Clone)]
pub struct StoredDeadLetter {
    /// Store-assigned id.
    pub id: i64,
    /// The dead letter itself.
    pub letter: DeadLetter,
    /// Current status.
    pub status: DlqStatus,
    /// When it was resolved or discarded, if it was.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Notes about the resolution.
    pub resolution_notes: Option<String>,
}

/// PostgreSQL-backed dead-letter store.
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    /// Create a store over a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, DlqError> {
        self.list_by_status(DlqStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the query fails.
    pub async fn list_by_status(
        &self,
        status: DlqStatus,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, DlqError> {
        let rows = sqlx::query(
            r"
            SELECT id, event_id, event_type, aggregate_id, topic, payload,
                   error_message, error_details, retry_count, status,
                   failed_at, resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE status = $1
            ORDER BY failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DlqError::Storage(e.to_string()))?;

        rows.iter().map(Self::row_to_stored).collect()
    }

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the query fails or the id is unknown.
    pub async fn get_by_id(&self, id: i64) -> Result<StoredDeadLetter, DlqError> {
        let row = sqlx::query(
            r"
            SELECT id, event_id, event_type, aggregate_id, topic, payload,
                   error_message, error_details, retry_count, status,
                   failed_at, resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DlqError::Storage(e.to_string()))?;

        Self::row_to_stored(&row)
    }

    /// Move an entry to a new status.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the update fails.
    pub async fn update_status(&self, id: i64, status: DlqStatus) -> Result<(), DlqError> {
        sqlx::query("UPDATE dead_letters SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DlqError::Storage(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "Dead letter status updated");
        Ok(())
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DlqError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = now(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DlqError::Storage(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("dlq.resolved").increment(1);
        Ok(())
    }

    /// Permanently discard an entry that cannot be fixed.
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DlqError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = now(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DlqError::Storage(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("dlq.discarded").increment(1);
        Ok(())
    }

    /// Count of pending entries (health checks).
    ///
    /// # Errors
    ///
    /// [`DlqError::Storage`] when the query fails.
    pub async fn count_pending(&self) -> Result<i64, DlqError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DlqError::Storage(e.to_string()))?;
        Ok(count)
    }

    fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredDeadLetter, DlqError> {
        let status_str: String = row.get("status");
        let status = DlqStatus::parse(&status_str)?;
        let retry_count: i32 = row.get("retry_count");

        Ok(StoredDeadLetter {
            id: row.get("id"),
            letter: DeadLetter {
                event_id: row.get::<Option<Uuid>, _>("event_id").map(EventId::from_uuid),
                event_type: row.get("event_type"),
                aggregate_id: row.get("aggregate_id"),
                topic: row.get("topic"),
                payload: row.get("payload"),
                error_message: row.get("error_message"),
                error_details: row.get("error_details"),
                retry_count: u32::try_from(retry_count).unwrap_or(0),
                failed_at: row.get("failed_at"),
            },
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for PgDeadLetterStore {
    fn push(&self, letter: DeadLetter) -> PortFuture<'_, Result<(), DeadLetterError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO dead_letters (
                    event_id, event_type, aggregate_id, topic, payload,
                    error_message, error_details, retry_count, failed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ",
            )
            .bind(letter.event_id.map(|id| *id.as_uuid()))
            .bind(&letter.event_type)
            .bind(&letter.aggregate_id)
            .bind(&letter.topic)
            .bind(&letter.payload)
            .bind(&letter.error_message)
            .bind(&letter.error_details)
            .bind(i32::try_from(letter.retry_count).unwrap_or(i32::MAX))
            .bind(letter.failed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError(e.to_string()))?;

            tracing::warn!(
                event_type = letter.event_type.as_deref().unwrap_or("<undecoded>"),
                topic = %letter.topic,
                error = %letter.error_message,
                retry_count = letter.retry_count,
                "Event added to dead-letter store"
            );
            metrics::counter!("dlq.added").increment(1);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::expect_used)] // Test code can use expect
    fn dlq_status_roundtrip() {
        for status in [
            DlqStatus::Pending,
            DlqStatus::Processing,
            DlqStatus::Resolved,
            DlqStatus::Discarded,
        ] {
            let parsed = DlqStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert!(DlqStatus::parse("bogus").is_err());
    }
}
