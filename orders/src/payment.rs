//! The outbound payment adapter.
//!
//! Wraps the external gateway port with the resilience contract the saga
//! relies on: a per-call deadline, bounded jittered retries for transient
//! faults, and a circuit breaker so a dead gateway fails fast instead of
//! stacking callers. A decline is a business outcome, not a fault — it is
//! never retried and never trips the breaker.
//!
//! No lock is ever held across these calls.

use ordermesh_core::ids::PaymentId;
use ordermesh_core::money::Money;
use ordermesh_core::ports::{PaymentError, PaymentGateway, PaymentOutcome, PaymentRequest};
use ordermesh_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use ordermesh_runtime::retry::{retry_with_policy, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Default gateway deadline per attempt.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline-, retry-, and breaker-guarded payment gateway.
pub struct PaymentAdapter {
    gateway: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    deadline: Duration,
}

impl PaymentAdapter {
    /// Wrap a gateway with default resilience settings.
    #[must_use]
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            gateway,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            retry: RetryPolicy::default(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Override the retry policy (tests use tight delays).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-attempt deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Override the breaker configuration.
    #[must_use]
    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(config);
        self
    }

    /// Attempt a charge. Gateways deduplicate on the request's order id, so
    /// a retried or re-driven charge for the same order settles at most
    /// once.
    ///
    /// # Errors
    ///
    /// [`PaymentError`] once the deadline, retry budget, or breaker gives
    /// up. A declined charge is `Ok(PaymentOutcome::Declined { .. })`.
    pub async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome, PaymentError> {
        retry_with_policy(
            &self.retry,
            |_err: &PaymentError| true, // every PaymentError is transient
            || async {
                let attempt = self.breaker.call(|| async {
                    match timeout(self.deadline, self.gateway.charge(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(PaymentError::Timeout),
                    }
                });
                match attempt.await {
                    Ok(outcome) => Ok(outcome),
                    Err(CircuitBreakerError::Open) => {
                        Err(PaymentError::Unavailable("circuit open".to_string()))
                    },
                    Err(CircuitBreakerError::Inner(e)) => Err(e),
                }
            },
        )
        .await
    }

    /// Refund a settled payment, with the same resilience contract.
    ///
    /// # Errors
    ///
    /// [`PaymentError`] once the deadline, retry budget, or breaker gives
    /// up.
    pub async fn refund(&self, payment_id: PaymentId, amount: Money) -> Result<(), PaymentError> {
        retry_with_policy(
            &self.retry,
            |_err: &PaymentError| true,
            || async {
                let attempt = self.breaker.call(|| async {
                    match timeout(self.deadline, self.gateway.refund(payment_id, amount)).await {
                        Ok(result) => result,
                        Err(_) => Err(PaymentError::Timeout),
                    }
                });
                match attempt.await {
                    Ok(()) => Ok(()),
                    Err(CircuitBreakerError::Open) => {
                        Err(PaymentError::Unavailable("circuit open".to_string()))
                    },
                    Err(CircuitBreakerError::Inner(e)) => Err(e),
                }
            },
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use ordermesh_core::ids::{CustomerId, OrderId};
    use ordermesh_core::money::Currency;
    use ordermesh_core::ports::PortFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowGateway;

    impl PaymentGateway for SlowGateway {
        fn charge(
            &self,
            _request: &PaymentRequest,
        ) -> PortFuture<'_, Result<PaymentOutcome, PaymentError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(PaymentOutcome::Approved {
                    payment_id: PaymentId::new(),
                    transaction_id: "late".to_string(),
                })
            })
        }

        fn refund(
            &self,
            _payment_id: PaymentId,
            _amount: Money,
        ) -> PortFuture<'_, Result<(), PaymentError>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FlakyGateway {
        calls: AtomicUsize,
        failures: usize,
    }

    impl PaymentGateway for FlakyGateway {
        fn charge(
            &self,
            _request: &PaymentRequest,
        ) -> PortFuture<'_, Result<PaymentOutcome, PaymentError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    Err(PaymentError::Unavailable("502".to_string()))
                } else {
                    Ok(PaymentOutcome::Approved {
                        payment_id: PaymentId::new(),
                        transaction_id: "ok".to_string(),
                    })
                }
            })
        }

        fn refund(
            &self,
            _payment_id: PaymentId,
            _amount: Money,
        ) -> PortFuture<'_, Result<(), PaymentError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: OrderId::new(),
            customer_id: CustomerId::new(),
            amount: Money::from_minor_units(1000, Currency::USD),
            method: "CARD".to_string(),
        }
    }

    fn tight_retry() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(2))
            .jitter(false)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_converts_to_timeout() {
        let adapter = PaymentAdapter::new(Arc::new(SlowGateway))
            .with_deadline(Duration::from_millis(100))
            .with_retry(RetryPolicy::builder().max_retries(0).build());

        let result = adapter.charge(&request()).await;
        assert!(matches!(result, Err(PaymentError::Timeout)));
    }

    #[tokio::test]
    async fn transient_faults_are_retried() {
        let gateway = Arc::new(FlakyGateway {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let adapter = PaymentAdapter::new(Arc::clone(&gateway) as Arc<dyn PaymentGateway>)
            .with_retry(tight_retry());

        let outcome = adapter.charge(&request()).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Approved { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let gateway = Arc::new(FlakyGateway {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
        });
        let adapter = PaymentAdapter::new(Arc::clone(&gateway) as Arc<dyn PaymentGateway>)
            .with_retry(RetryPolicy::builder().max_retries(0).build())
            .with_breaker(CircuitBreakerConfig::builder().failure_threshold(2).build());

        for _ in 0..2 {
            let _ = adapter.charge(&request()).await;
        }
        let calls_before = gateway.calls.load(Ordering::SeqCst);

        let result = adapter.charge(&request()).await;
        assert!(matches!(result, Err(PaymentError::Unavailable(_))));
        // The breaker rejected before reaching the gateway.
        assert_eq!(gateway.calls.load(Ordering::SeqCst), calls_before);
    }
}
