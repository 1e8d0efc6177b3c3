//! The event envelope.
//!
//! Every published event is wrapped in an [`EventEnvelope`] carrying the
//! metadata consumers need for idempotence (`event_id`), routing
//! (`aggregate_id`, used as the partition key), causality
//! (`correlation_id`) and provenance (`source_service`). Envelopes are
//! immutable after construction.

use crate::events::EventPayload;
use crate::ids::{CorrelationId, EventId};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable domain event plus its delivery metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    occurred_at: DateTime<Utc>,
    version: Version,
    correlation_id: CorrelationId,
    source_service: String,
    payload: EventPayload,
}

impl EventEnvelope {
    /// Wrap a payload, deriving the type tag and aggregate reference from it.
    ///
    /// `version` is the aggregate version at the moment the event was
    /// emitted; `correlation_id` ties the event to the business flow it
    /// belongs to.
    #[must_use]
    pub fn new(
        payload: EventPayload,
        version: Version,
        correlation_id: CorrelationId,
        source_service: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: payload.event_type().to_string(),
            aggregate_id: payload.aggregate_id(),
            aggregate_type: payload.aggregate_type().to_string(),
            occurred_at,
            version,
            correlation_id,
            source_service: source_service.into(),
            payload,
        }
    }

    /// Rehydrate an envelope decoded from the wire.
    #[allow(clippy::too_many_arguments)] // Wire decoding carries every header
    #[must_use]
    pub fn from_parts(
        event_id: EventId,
        event_type: String,
        aggregate_id: String,
        aggregate_type: String,
        occurred_at: DateTime<Utc>,
        version: Version,
        correlation_id: CorrelationId,
        source_service: String,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id,
            event_type,
            aggregate_id,
            aggregate_type,
            occurred_at,
            version,
            correlation_id,
            source_service,
            payload,
        }
    }

    /// Unique id of this event occurrence.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Versioned type tag, e.g. `StockReserved.v1`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Owning aggregate id; also the broker partition key.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Owning aggregate type label.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// When the event occurred.
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Aggregate version at emission.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The business flow this event belongs to.
    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// The service that published the event.
    #[must_use]
    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    /// The domain payload.
    #[must_use]
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// The broker topic for this event.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        self.payload.topic()
    }

    /// The partition key (the aggregate id).
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.aggregate_id
    }
}

impl std::fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] on {} {}",
            self.event_type, self.event_id, self.aggregate_type, self.aggregate_id
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::events::OrderFailed;
    use crate::ids::OrderId;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn envelope_derives_headers_from_payload() {
        let order_id = OrderId::new();
        let envelope = EventEnvelope::new(
            EventPayload::OrderFailed(OrderFailed {
                order_id,
                reason: "insufficient stock".to_string(),
                failed_at: fixed_now(),
            }),
            Version::new(3),
            CorrelationId::new(),
            "order-service",
            fixed_now(),
        );

        assert_eq!(envelope.event_type(), "OrderFailed.v1");
        assert_eq!(envelope.aggregate_id(), order_id.to_string());
        assert_eq!(envelope.aggregate_type(), "order");
        assert_eq!(envelope.partition_key(), envelope.aggregate_id());
        assert_eq!(envelope.topic(), "order-failed");
        assert_eq!(envelope.version(), Version::new(3));
        assert_eq!(envelope.source_service(), "order-service");
    }

    #[test]
    fn fresh_envelopes_get_distinct_event_ids() {
        let make = || {
            EventEnvelope::new(
                EventPayload::OrderFailed(OrderFailed {
                    order_id: OrderId::new(),
                    reason: "x".to_string(),
                    failed_at: fixed_now(),
                }),
                Version::INITIAL,
                CorrelationId::new(),
                "order-service",
                fixed_now(),
            )
        };
        assert_ne!(make().event_id(), make().event_id());
    }
}
