//! Ports: the abstract capabilities the domain is wired to at boot.
//!
//! Process-level resources (repositories, the event bus, the lock store,
//! the payment gateway) are constructed once at startup and injected into
//! services. All external dependencies sit behind these traits so tests run
//! against in-memory implementations and production swaps in Postgres,
//! Redpanda, and the real gateway without touching domain code.
//!
//! # Dyn Compatibility
//!
//! The async traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so they can be used as trait objects (`Arc<dyn …>`) shared
//! across tasks.

use crate::envelope::EventEnvelope;
use crate::error::{Classify, ErrorClass};
use crate::ids::{CustomerId, EventId, OrderId, PaymentId, ProductId};
use crate::money::Money;
use crate::order::Order;
use crate::product::Product;
use crate::version::Version;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future alias used by every port.
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstracts time so services and tests share one notion of "now".
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Errors from aggregate repositories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The aggregate does not exist.
    #[error("Aggregate not found: {0}")]
    NotFound(String),

    /// The optimistic version check failed: another writer committed first.
    #[error("Concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The version the caller loaded.
        expected: Version,
        /// The version actually stored.
        actual: Version,
    },

    /// The storage layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A row could not be mapped back into an aggregate.
    #[error("Row mapping error: {0}")]
    Mapping(String),
}

impl Classify for RepositoryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::ConcurrencyConflict { .. } => ErrorClass::Conflict,
            Self::Storage(_) => ErrorClass::Transient,
            Self::Mapping(_) => ErrorClass::Fatal,
        }
    }
}

/// Loads and stores product aggregates (product row + its reservations as
/// one unit; no lazy edges).
pub trait ProductRepository: Send + Sync {
    /// Load the full aggregate.
    fn load(&self, product_id: ProductId) -> PortFuture<'_, Result<Product, RepositoryError>>;

    /// Insert a new aggregate at its initial version.
    fn insert(&self, product: &Product) -> PortFuture<'_, Result<(), RepositoryError>>;

    /// Persist a mutated aggregate, asserting the stored version still
    /// equals `expected`.
    fn save(
        &self,
        product: &Product,
        expected: Version,
    ) -> PortFuture<'_, Result<(), RepositoryError>>;

    /// Products holding at least one `Active` reservation with
    /// `expires_at <= now`, for the expirer sweep.
    fn products_with_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>>;

    /// Products holding any reservation for the given order, for saga
    /// confirmation and compensation.
    fn products_with_reservations_for_order(
        &self,
        order_id: OrderId,
    ) -> PortFuture<'_, Result<Vec<ProductId>, RepositoryError>>;
}

/// Loads and stores order aggregates (order row + items as one unit).
pub trait OrderRepository: Send + Sync {
    /// Load the full aggregate.
    fn load(&self, order_id: OrderId) -> PortFuture<'_, Result<Order, RepositoryError>>;

    /// Insert a new aggregate at its initial version.
    fn insert(&self, order: &Order) -> PortFuture<'_, Result<(), RepositoryError>>;

    /// Persist a mutated aggregate, asserting the stored version still
    /// equals `expected`.
    fn save(
        &self,
        order: &Order,
        expected: Version,
    ) -> PortFuture<'_, Result<(), RepositoryError>>;

    /// The most recent non-terminal order by `customer_id` whose content
    /// hash matches, created at or after `window_start`. Backs
    /// duplicate-order rejection.
    fn find_duplicate(
        &self,
        customer_id: CustomerId,
        content_hash: u64,
        window_start: DateTime<Utc>,
    ) -> PortFuture<'_, Result<Option<OrderId>, RepositoryError>>;
}

/// Errors from the event bus.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Could not reach the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A publish did not get acknowledged.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// Why.
        reason: String,
    },

    /// Could not subscribe.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The requested topics.
        topics: Vec<String>,
        /// Why.
        reason: String,
    },

    /// Received bytes that are not a valid envelope.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Transport-level failure mid-stream.
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl Classify for EventBusError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::DeserializationFailed(_) => ErrorClass::Fatal,
            Self::ConnectionFailed(_)
            | Self::PublishFailed { .. }
            | Self::SubscriptionFailed { .. }
            | Self::TransportError(_) => ErrorClass::Transient,
        }
    }
}

/// Stream of decoded envelopes from a subscription. Items within one
/// partition arrive in production order.
pub type EnvelopeStream =
    Pin<Box<dyn Stream<Item = Result<EventEnvelope, EventBusError>> + Send>>;

/// Publishes envelopes to the broker with at-least-once semantics once the
/// future resolves `Ok`.
pub trait EventPublisher: Send + Sync {
    /// Publish one envelope to its topic, keyed by its aggregate id.
    fn publish(&self, envelope: &EventEnvelope) -> PortFuture<'_, Result<(), EventBusError>>;
}

/// Subscribes to topics and yields decoded envelopes.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to the given topics as one consumer group member.
    fn subscribe(&self, topics: &[&str]) -> PortFuture<'_, Result<EnvelopeStream, EventBusError>>;
}

/// Errors from the processed-event log.
#[derive(Error, Debug, Clone)]
#[error("Processed-event log error: {0}")]
pub struct ProcessedLogError(pub String);

impl Classify for ProcessedLogError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// The per-consumer idempotence ledger. Side effects are keyed on
/// `(event_id, aggregate_id)`: re-delivery of an already-recorded event is
/// detected and skipped.
pub trait ProcessedEventLog: Send + Sync {
    /// Whether this consumer already handled the event.
    fn already_processed(
        &self,
        consumer: &str,
        event_id: EventId,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>>;

    /// Record the event as handled. Returns `false` when it was already
    /// recorded (atomic insert-if-absent).
    fn mark_if_new(
        &self,
        consumer: &str,
        event_id: EventId,
        aggregate_id: &str,
    ) -> PortFuture<'_, Result<bool, ProcessedLogError>>;
}

/// A message that exhausted its retries or hit a non-retryable error.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    /// The event id, when the envelope decoded far enough to know it.
    pub event_id: Option<EventId>,
    /// The type tag, when known.
    pub event_type: Option<String>,
    /// The aggregate id, when known.
    pub aggregate_id: Option<String>,
    /// The topic the message came from or was headed to.
    pub topic: String,
    /// The raw payload bytes.
    pub payload: Vec<u8>,
    /// Human-readable error.
    pub error_message: String,
    /// Full error details (debug output).
    pub error_details: Option<String>,
    /// How many handler attempts were made.
    pub retry_count: u32,
    /// When the message was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build a dead letter from a decoded envelope.
    #[must_use]
    pub fn from_envelope(
        envelope: &EventEnvelope,
        payload: Vec<u8>,
        error_message: impl Into<String>,
        error_details: Option<String>,
        retry_count: u32,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Some(envelope.event_id()),
            event_type: Some(envelope.event_type().to_string()),
            aggregate_id: Some(envelope.aggregate_id().to_string()),
            topic: envelope.topic().to_string(),
            payload,
            error_message: error_message.into(),
            error_details,
            retry_count,
            failed_at,
        }
    }

    /// Build a dead letter from bytes that never decoded.
    #[must_use]
    pub fn from_raw(
        topic: impl Into<String>,
        payload: Vec<u8>,
        error_message: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: None,
            event_type: None,
            aggregate_id: None,
            topic: topic.into(),
            payload,
            error_message: error_message.into(),
            error_details: None,
            retry_count: 0,
            failed_at,
        }
    }
}

/// Errors from the dead-letter sink itself.
#[derive(Error, Debug, Clone)]
#[error("Dead-letter sink error: {0}")]
pub struct DeadLetterError(pub String);

impl Classify for DeadLetterError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Durable destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Persist one dead letter.
    fn push(&self, letter: DeadLetter) -> PortFuture<'_, Result<(), DeadLetterError>>;
}

/// A charge request sent to the external gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentRequest {
    /// The order being paid.
    pub order_id: OrderId,
    /// The paying customer.
    pub customer_id: CustomerId,
    /// The amount to charge.
    pub amount: Money,
    /// Payment method label.
    pub method: String,
}

/// The gateway's decision on a charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The charge settled.
    Approved {
        /// The gateway's payment record.
        payment_id: PaymentId,
        /// The gateway's transaction reference.
        transaction_id: String,
    },
    /// The gateway refused the charge. A business outcome, not an error.
    Declined {
        /// The gateway's stated reason.
        reason: String,
    },
}

/// Transport-level payment failures (a decline is *not* an error — see
/// [`PaymentOutcome::Declined`]).
#[derive(Error, Debug, Clone)]
pub enum PaymentError {
    /// The gateway did not answer within the deadline.
    #[error("Payment gateway timed out")]
    Timeout,

    /// The gateway is unreachable or answered with a server fault.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

impl Classify for PaymentError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// The external payment gateway contract.
pub trait PaymentGateway: Send + Sync {
    /// Attempt a charge.
    fn charge(
        &self,
        request: &PaymentRequest,
    ) -> PortFuture<'_, Result<PaymentOutcome, PaymentError>>;

    /// Refund a settled payment.
    fn refund(
        &self,
        payment_id: PaymentId,
        amount: Money,
    ) -> PortFuture<'_, Result<(), PaymentError>>;
}

/// Errors from the lock store.
#[derive(Error, Debug, Clone)]
#[error("Lock store error: {0}")]
pub struct LockStoreError(pub String);

impl Classify for LockStoreError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// The backing store for the distributed lock service. The store enforces
/// lease expiry as absolute wall-clock instants; the lock service layers
/// waiting, fairness, re-entrancy, and renewal on top.
pub trait LockStore: Send + Sync {
    /// Try to take `key` for `owner` with the given lease. Succeeds when the
    /// key is free, its current lease has lapsed, or `owner` already holds
    /// it (extending the lease). Returns whether the lock is now held.
    fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> PortFuture<'_, Result<bool, LockStoreError>>;

    /// Extend the lease, only if `owner` still holds the key.
    fn renew(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> PortFuture<'_, Result<bool, LockStoreError>>;

    /// Release the key, only if `owner` still holds it. Returns whether a
    /// release happened.
    fn release(&self, key: &str, owner: &str) -> PortFuture<'_, Result<bool, LockStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_errors_classify_per_taxonomy() {
        assert_eq!(
            RepositoryError::NotFound("order".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            RepositoryError::ConcurrencyConflict {
                expected: Version::new(1),
                actual: Version::new(2),
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            RepositoryError::Storage("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            RepositoryError::Mapping("bad row".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn bus_deserialization_failures_are_fatal() {
        assert_eq!(
            EventBusError::DeserializationFailed("garbage".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            EventBusError::TransportError("broker away".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn concurrency_conflict_display() {
        let error = RepositoryError::ConcurrencyConflict {
            expected: Version::new(5),
            actual: Version::new(7),
        };
        let display = format!("{error}");
        assert!(display.contains("expected version 5"));
        assert!(display.contains("found 7"));
    }
}
