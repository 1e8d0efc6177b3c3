//! Reliable event publishing.
//!
//! Wraps any [`EventPublisher`] with the bounded publish retry policy
//! (3 attempts, base 1 s, jittered). When the budget is exhausted the
//! envelope is written to the dead-letter sink with its failure context and
//! the error is surfaced — an accepted publish is at-least-once, a failed
//! one is never silently dropped.

use crate::retry::{retry_with_policy, RetryPolicy};
use ordermesh_core::codec;
use ordermesh_core::ports::{Clock, DeadLetter, DeadLetterSink, EventBusError, EventPublisher};
use ordermesh_core::{Classify, EventEnvelope};
use std::sync::Arc;

/// Retry-then-dead-letter publisher.
pub struct ReliablePublisher {
    inner: Arc<dyn EventPublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl ReliablePublisher {
    /// Wrap a publisher with the default publish retry policy.
    #[must_use]
    pub fn new(
        inner: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            dead_letters,
            clock,
            policy: RetryPolicy::publisher(),
        }
    }

    /// Override the retry policy (tests use tight delays).
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish with retries; dead-letter on exhaustion.
    ///
    /// # Errors
    ///
    /// The final [`EventBusError`] after the retry budget is spent. By that
    /// point the envelope has been pushed to the dead-letter sink.
    pub async fn publish(&self, envelope: &EventEnvelope) -> Result<(), EventBusError> {
        let result = retry_with_policy(
            &self.policy,
            |err: &EventBusError| err.class().is_retryable(),
            || self.inner.publish(envelope),
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let attempts = self.policy.max_retries + 1;
                tracing::error!(
                    event_type = envelope.event_type(),
                    aggregate_id = envelope.aggregate_id(),
                    attempts,
                    error = %err,
                    "Publish exhausted retries, dead-lettering"
                );
                metrics::counter!("publisher.dead_lettered").increment(1);

                let payload = codec::encode(envelope).unwrap_or_default();
                let letter = DeadLetter::from_envelope(
                    envelope,
                    payload,
                    err.to_string(),
                    Some(format!("{err:?}")),
                    attempts,
                    self.clock.now(),
                );
                if let Err(sink_err) = self.dead_letters.push(letter).await {
                    tracing::error!(
                        event_id = %envelope.event_id(),
                        error = %sink_err,
                        "Dead-letter sink rejected the failed publish"
                    );
                }
                Err(err)
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use ordermesh_core::events::{EventPayload, OrderFailed};
    use ordermesh_core::ids::{CorrelationId, OrderId};
    use ordermesh_core::ports::{DeadLetterError, PortFuture};
    use ordermesh_core::Version;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct FixedClock;
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            fixed_now()
        }
    }

    /// Publisher that fails the first `failures` calls.
    struct FlakyPublisher {
        failures: usize,
        calls: AtomicUsize,
    }

    impl EventPublisher for FlakyPublisher {
        fn publish(&self, envelope: &EventEnvelope) -> PortFuture<'_, Result<(), EventBusError>> {
            let topic = envelope.topic().to_string();
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: "broker unavailable".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        letters: Mutex<Vec<DeadLetter>>,
    }

    impl DeadLetterSink for RecordingSink {
        fn push(&self, letter: DeadLetter) -> PortFuture<'_, Result<(), DeadLetterError>> {
            Box::pin(async move {
                self.letters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(letter);
                Ok(())
            })
        }
    }

    fn envelope() -> EventEnvelope {
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
    }

    fn tight_policy() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(5))
            .jitter(false)
            .build()
    }

    #[tokio::test]
    async fn retries_through_transient_failures() {
        let inner = Arc::new(FlakyPublisher {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let publisher = ReliablePublisher::new(
            Arc::clone(&inner) as Arc<dyn EventPublisher>,
            Arc::clone(&sink) as Arc<dyn DeadLetterSink>,
            Arc::new(FixedClock),
        )
        .with_policy(tight_policy());

        publisher.publish(&envelope()).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert!(sink.letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_letters_after_exhaustion() {
        let inner = Arc::new(FlakyPublisher {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let publisher = ReliablePublisher::new(
            inner as Arc<dyn EventPublisher>,
            Arc::clone(&sink) as Arc<dyn DeadLetterSink>,
            Arc::new(FixedClock),
        )
        .with_policy(tight_policy());

        let env = envelope();
        let result = publisher.publish(&env).await;
        assert!(result.is_err());

        let letters = sink.letters.lock().unwrap();
        assert_eq!(letters.len(), 1);
        let letter = &letters[0];
        assert_eq!(letter.event_id, Some(env.event_id()));
        assert_eq!(letter.event_type.as_deref(), Some("OrderFailed.v1"));
        assert_eq!(letter.retry_count, 3);
        assert!(!letter.payload.is_empty());
    }
}
