//! Tunable settings with their system defaults.
//!
//! Every knob the subsystem exposes is enumerated here so deployments can
//! override them from their configuration source of choice (the structs
//! deserialize with serde). Defaults match the documented operating values.

use chrono::Duration;
use serde::Deserialize;
use std::time::Duration as StdDuration;

/// Order-context settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Customer-initiated cancel window after payment, in hours.
    pub cancellation_window_hours: i64,
    /// Rejection window for identical re-submissions, in minutes.
    pub duplicate_window_minutes: i64,
    /// Maximum line items per order.
    pub max_items: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            cancellation_window_hours: 24,
            duplicate_window_minutes: 5,
            max_items: 100,
        }
    }
}

impl OrderConfig {
    /// The cancellation window as a duration.
    #[must_use]
    pub fn cancellation_window(&self) -> Duration {
        Duration::hours(self.cancellation_window_hours)
    }

    /// The duplicate-rejection window as a duration.
    #[must_use]
    pub fn duplicate_window(&self) -> Duration {
        Duration::minutes(self.duplicate_window_minutes)
    }
}

/// Inventory-context settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Lifetime of an `Active` reservation, in seconds (default 30 min).
    pub ttl_secs: i64,
    /// Reservation sweep period, in seconds.
    pub expirer_interval_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            expirer_interval_secs: 60,
        }
    }
}

impl ReservationConfig {
    /// The reservation TTL as a duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs)
    }

    /// The sweep period.
    #[must_use]
    pub const fn expirer_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.expirer_interval_secs)
    }
}

/// Distributed-lock settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long an acquire waits before timing out, in milliseconds.
    pub default_wait_ms: u64,
    /// Lease granted on acquisition, in milliseconds.
    pub default_lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_wait_ms: 3_000,
            default_lease_ms: 10_000,
        }
    }
}

impl LockConfig {
    /// The default acquire wait.
    #[must_use]
    pub const fn default_wait(&self) -> StdDuration {
        StdDuration::from_millis(self.default_wait_ms)
    }

    /// The default lease.
    #[must_use]
    pub const fn default_lease(&self) -> StdDuration {
        StdDuration::from_millis(self.default_lease_ms)
    }
}

/// Cache settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Product cache TTL, in seconds.
    pub product_ttl_secs: u64,
    /// Stock-quantity cache TTL, in seconds.
    pub stock_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            product_ttl_secs: 600,
            stock_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    /// The product cache TTL.
    #[must_use]
    pub const fn product_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.product_ttl_secs)
    }

    /// The stock cache TTL.
    #[must_use]
    pub const fn stock_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.stock_ttl_secs)
    }
}

/// Publisher and consumer retry budgets.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Publish attempts before dead-lettering.
    pub publisher_retry_max: u32,
    /// Handler attempts before dead-lettering.
    pub consumer_retry_max: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            publisher_retry_max: 3,
            consumer_retry_max: 3,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operating_values() {
        let order = OrderConfig::default();
        assert_eq!(order.cancellation_window(), Duration::hours(24));
        assert_eq!(order.duplicate_window(), Duration::minutes(5));
        assert_eq!(order.max_items, 100);

        let reservation = ReservationConfig::default();
        assert_eq!(reservation.ttl(), Duration::minutes(30));
        assert_eq!(reservation.expirer_interval(), StdDuration::from_secs(60));

        let lock = LockConfig::default();
        assert_eq!(lock.default_wait(), StdDuration::from_secs(3));
        assert_eq!(lock.default_lease(), StdDuration::from_secs(10));

        let cache = CacheConfig::default();
        assert_eq!(cache.product_ttl(), StdDuration::from_secs(600));
        assert_eq!(cache.stock_ttl(), StdDuration::from_secs(300));

        let delivery = DeliveryConfig::default();
        assert_eq!(delivery.publisher_retry_max, 3);
        assert_eq!(delivery.consumer_retry_max, 3);
    }

    #[test]
    fn partial_overrides_deserialize() {
        let cache: CacheConfig =
            serde_json::from_str(r#"{ "stock_ttl_secs": 120 }"#).unwrap();
        assert_eq!(cache.stock_ttl(), StdDuration::from_secs(120));
        assert_eq!(cache.product_ttl(), StdDuration::from_secs(600));
    }
}
