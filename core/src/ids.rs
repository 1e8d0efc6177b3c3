//! Opaque domain identifiers.
//!
//! Every aggregate and cross-service reference is identified by an opaque
//! 128-bit value with a canonical hyphenated textual form. Identifiers are
//! produced either fresh (`new()`) or by a validating parse of external
//! input. Equality is byte equality.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when an identifier fails to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind} identifier: {input}")]
pub struct ParseIdError {
    /// The identifier kind that failed to parse (e.g. "product").
    pub kind: &'static str,
    /// The rejected input.
    pub input: String,
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Construct from a raw UUID (trusted input).
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|_| ParseIdError {
                    kind: $kind,
                    input: s.to_string(),
                })
            }
        }
    };
}

define_id!(
    /// Identifies a product aggregate in the inventory context.
    ProductId,
    "product"
);
define_id!(
    /// Identifies an order aggregate in the order context.
    OrderId,
    "order"
);
define_id!(
    /// Identifies a customer.
    CustomerId,
    "customer"
);
define_id!(
    /// Identifies a single stock reservation within a product aggregate.
    ReservationId,
    "reservation"
);
define_id!(
    /// Identifies a payment at the external gateway.
    PaymentId,
    "payment"
);
define_id!(
    /// Uniquely identifies a published domain event.
    EventId,
    "event"
);
define_id!(
    /// Correlates all events and errors belonging to one business flow.
    CorrelationId,
    "correlation"
);

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(ProductId::new(), ProductId::new());
        assert_ne!(OrderId::new(), OrderId::new());
    }

    #[test]
    fn parse_roundtrip() {
        let id = ReservationId::new();
        let parsed: ReservationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        let result = "not-a-uuid".parse::<OrderId>();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind, "order");
    }

    #[test]
    fn byte_equality() {
        let raw = Uuid::new_v4();
        assert_eq!(CustomerId::from_uuid(raw), CustomerId::from_uuid(raw));
    }

    #[test]
    fn display_is_canonical_hyphenated() {
        let id = EventId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
    }
}
