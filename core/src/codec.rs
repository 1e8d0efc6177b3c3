//! The wire codec for event envelopes.
//!
//! Envelopes travel as self-describing JSON: the headers are flat camelCase
//! fields and the payload is dispatched on the explicit `eventType` tag.
//! Each tag has a hand-written decode arm; an unknown tag is a fatal error
//! the consumer routes to the dead-letter queue — never silently ignored.

use crate::envelope::EventEnvelope;
use crate::error::{Classify, ErrorClass};
use crate::events::EventPayload;
use crate::ids::{CorrelationId, EventId};
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from envelope encoding and decoding.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The envelope could not be serialized.
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// The bytes are not a valid envelope.
    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    /// The `eventType` tag is not one this codec knows.
    #[error("Unknown event type tag: {0}")]
    UnknownEventType(String),
}

impl Classify for CodecError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// The on-wire shape: headers plus an untyped payload resolved by tag.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    event_id: EventId,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    occurred_at: DateTime<Utc>,
    version: Version,
    correlation_id: CorrelationId,
    source_service: String,
    payload: serde_json::Value,
}

fn encode_payload(payload: &EventPayload) -> Result<serde_json::Value, serde_json::Error> {
    match payload {
        EventPayload::OrderCreated(e) => serde_json::to_value(e),
        EventPayload::StockReserved(e) => serde_json::to_value(e),
        EventPayload::StockReleased(e) => serde_json::to_value(e),
        EventPayload::StockDeducted(e) => serde_json::to_value(e),
        EventPayload::PaymentCompleted(e) => serde_json::to_value(e),
        EventPayload::PaymentFailed(e) => serde_json::to_value(e),
        EventPayload::OrderCancelled(e) => serde_json::to_value(e),
        EventPayload::OrderFailed(e) => serde_json::to_value(e),
        EventPayload::LowStockAlert(e) => serde_json::to_value(e),
    }
}

fn decode_payload(
    event_type: &str,
    value: serde_json::Value,
) -> Result<EventPayload, CodecError> {
    let payload = match event_type {
        "OrderCreated.v1" => EventPayload::OrderCreated(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "StockReserved.v1" => EventPayload::StockReserved(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "StockReleased.v1" => EventPayload::StockReleased(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "StockDeducted.v1" => EventPayload::StockDeducted(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "PaymentCompleted.v1" => EventPayload::PaymentCompleted(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "PaymentFailed.v1" => EventPayload::PaymentFailed(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "OrderCancelled.v1" => EventPayload::OrderCancelled(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "OrderFailed.v1" => EventPayload::OrderFailed(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        "LowStockAlert.v1" => EventPayload::LowStockAlert(
            serde_json::from_value(value).map_err(CodecError::Decode)?,
        ),
        other => return Err(CodecError::UnknownEventType(other.to_string())),
    };
    Ok(payload)
}

/// Encode an envelope to its wire bytes.
///
/// # Errors
///
/// [`CodecError::Encode`] when serialization fails (practically unreachable
/// for these types).
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, CodecError> {
    let wire = WireEnvelope {
        event_id: envelope.event_id(),
        event_type: envelope.event_type().to_string(),
        aggregate_id: envelope.aggregate_id().to_string(),
        aggregate_type: envelope.aggregate_type().to_string(),
        occurred_at: envelope.occurred_at(),
        version: envelope.version(),
        correlation_id: envelope.correlation_id(),
        source_service: envelope.source_service().to_string(),
        payload: encode_payload(envelope.payload()).map_err(CodecError::Encode)?,
    };
    serde_json::to_vec(&wire).map_err(CodecError::Encode)
}

/// Decode wire bytes back into an envelope.
///
/// # Errors
///
/// [`CodecError::Decode`] for malformed bytes,
/// [`CodecError::UnknownEventType`] for a tag this codec does not know.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
    let payload = decode_payload(&wire.event_type, wire.payload)?;
    Ok(EventEnvelope::from_parts(
        wire.event_id,
        wire.event_type,
        wire.aggregate_id,
        wire.aggregate_type,
        wire.occurred_at,
        wire.version,
        wire.correlation_id,
        wire.source_service,
        payload,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::events::{OrderCreated, OrderCreatedItem, StockItem, StockReserved};
    use crate::ids::{CustomerId, OrderId, ProductId, ReservationId};
    use crate::money::{Currency, Money};
    use crate::quantity::Quantity;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn order_created_envelope() -> EventEnvelope {
        EventEnvelope::new(
            EventPayload::OrderCreated(OrderCreated {
                order_id: OrderId::new(),
                customer_id: CustomerId::new(),
                items: vec![OrderCreatedItem {
                    product_id: ProductId::new(),
                    quantity: Quantity::new(3),
                    unit_price: 1000,
                    currency: Currency::USD,
                }],
                total_amount: Money::from_minor_units(3000, Currency::USD),
                created_at: fixed_now(),
            }),
            Version::INITIAL,
            CorrelationId::new(),
            "order-service",
            fixed_now(),
        )
    }

    #[test]
    fn roundtrip_preserves_envelope() {
        let envelope = order_created_envelope();
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn wire_form_is_self_describing() {
        let envelope = EventEnvelope::new(
            EventPayload::StockReserved(StockReserved {
                inventory_id: ProductId::new(),
                reservation_id: ReservationId::new(),
                order_id: OrderId::new(),
                items: vec![StockItem {
                    product_id: ProductId::new(),
                    quantity: Quantity::new(1),
                    warehouse_id: "MAIN".to_string(),
                }],
                expires_at: fixed_now(),
            }),
            Version::new(7),
            CorrelationId::new(),
            "inventory-service",
            fixed_now(),
        );

        let bytes = encode(&envelope).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["eventType"], "StockReserved.v1");
        assert_eq!(json["aggregateType"], "product");
        assert_eq!(json["sourceService"], "inventory-service");
        assert!(json["payload"]["reservationId"].is_string());
        assert_eq!(json["payload"]["items"][0]["warehouseId"], "MAIN");
    }

    #[test]
    fn unknown_tag_is_rejected_not_ignored() {
        let envelope = order_created_envelope();
        let bytes = encode(&envelope).unwrap();
        let mut json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["eventType"] = serde_json::Value::String("OrderTeleported.v9".to_string());
        let tampered = serde_json::to_vec(&json).unwrap();

        let err = decode(&tampered).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEventType(ref tag) if tag == "OrderTeleported.v9"));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn malformed_bytes_fail_decode() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Decode(_))));
    }
}
