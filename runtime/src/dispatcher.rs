//! Idempotent event consumption.
//!
//! A [`Dispatcher`] drives one subscription stream sequentially (consumers
//! are single-threaded per partition) and routes each envelope to the
//! handler registered for its event type:
//!
//! 1. Duplicates — events already in the processed-event log — are skipped.
//! 2. The handler runs; transient and conflict failures are retried with
//!    backoff up to the consumer retry budget.
//! 3. Business-rule, validation, and fatal failures are never retried:
//!    the envelope goes to the dead-letter sink with its failure context.
//! 4. On success the event is recorded in the processed log, so a
//!    re-delivery of the same `(event_id, aggregate_id)` produces no second
//!    side effect.

use crate::retry::RetryPolicy;
use futures::StreamExt;
use ordermesh_core::codec;
use ordermesh_core::ports::{
    Clock, DeadLetter, DeadLetterSink, EnvelopeStream, EventBusError, PortFuture,
    ProcessedEventLog,
};
use ordermesh_core::{Classify, ErrorClass, EventEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A handler failure carrying its error class, which decides retry vs DLQ.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HandlerError {
    /// The taxonomy class of the failure.
    pub class: ErrorClass,
    /// Human-readable message.
    pub message: String,
    /// Full details for the dead-letter record.
    pub details: Option<String>,
}

impl HandlerError {
    /// A transient failure (retried).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            details: None,
        }
    }

    /// A business-rule violation (dead-lettered, never retried).
    #[must_use]
    pub fn business_rule(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::BusinessRule,
            message: message.into(),
            details: None,
        }
    }

    /// A fatal failure (dead-lettered with full context).
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
            details: None,
        }
    }

    /// Wrap any classified error, preserving its class and debug detail.
    #[must_use]
    pub fn from_classified<E>(err: &E) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Classify,
    {
        Self {
            class: err.class(),
            message: err.to_string(),
            details: Some(format!("{err:?}")),
        }
    }
}

impl Classify for HandlerError {
    fn class(&self) -> ErrorClass {
        self.class
    }
}

/// A consumer-side event handler.
pub trait EventHandler: Send + Sync {
    /// Handle one envelope. Must be idempotent: the dispatcher deduplicates
    /// on the processed log, but a crash between handling and recording
    /// re-delivers the event.
    fn handle(&self, envelope: &EventEnvelope) -> PortFuture<'_, Result<(), HandlerError>>;
}

/// Routes envelopes from one subscription to registered handlers with
/// idempotence and class-based retry/DLQ policy.
pub struct Dispatcher {
    consumer: String,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    processed: Arc<dyn ProcessedEventLog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    retry_max: u32,
}

impl Dispatcher {
    /// Create a dispatcher for the named consumer group.
    #[must_use]
    pub fn new(
        consumer: impl Into<String>,
        processed: Arc<dyn ProcessedEventLog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            handlers: HashMap::new(),
            processed,
            dead_letters,
            clock,
            retry_policy: RetryPolicy::default(),
            retry_max: 3,
        }
    }

    /// Register the handler for an event type tag (e.g. `StockReserved.v1`).
    #[must_use]
    pub fn register(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    /// Override the handler retry budget and backoff (tests use tight
    /// delays).
    #[must_use]
    pub fn with_retry(mut self, retry_max: u32, policy: RetryPolicy) -> Self {
        self.retry_max = retry_max;
        self.retry_policy = policy;
        self
    }

    /// Consume a stream until it ends. Envelopes are processed strictly in
    /// order, one at a time.
    pub async fn run(&self, mut stream: EnvelopeStream) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(envelope) => self.process(&envelope).await,
                Err(err) => self.handle_stream_error(&err).await,
            }
        }
        tracing::info!(consumer = %self.consumer, "Subscription stream ended");
    }

    async fn handle_stream_error(&self, err: &EventBusError) {
        if err.class() == ErrorClass::Fatal {
            // Undecodable message: route what we know to the DLQ rather
            // than silently dropping it.
            tracing::error!(consumer = %self.consumer, error = %err, "Fatal stream error, dead-lettering");
            let letter = DeadLetter::from_raw(
                "unknown",
                Vec::new(),
                err.to_string(),
                self.clock.now(),
            );
            if let Err(sink_err) = self.dead_letters.push(letter).await {
                tracing::error!(error = %sink_err, "Dead-letter sink rejected stream error");
            }
        } else {
            tracing::warn!(consumer = %self.consumer, error = %err, "Transient stream error");
        }
    }

    /// Process one envelope end-to-end. Public so sagas can be driven
    /// directly in tests without a broker.
    pub async fn process(&self, envelope: &EventEnvelope) {
        let Some(handler) = self.handlers.get(envelope.event_type()) else {
            tracing::debug!(
                consumer = %self.consumer,
                event_type = envelope.event_type(),
                "No handler registered, skipping"
            );
            return;
        };

        match self
            .processed
            .already_processed(&self.consumer, envelope.event_id())
            .await
        {
            Ok(true) => {
                tracing::debug!(
                    consumer = %self.consumer,
                    event_id = %envelope.event_id(),
                    "Duplicate delivery, skipping"
                );
                metrics::counter!("consumer.duplicate_skipped").increment(1);
                return;
            },
            Ok(false) => {},
            Err(e) => {
                // If the log is unreachable we still handle: handlers are
                // idempotent and the mark below will be retried by the next
                // delivery.
                tracing::warn!(error = %e, "Processed-log check failed, handling anyway");
            },
        }

        let mut attempt: u32 = 0;
        loop {
            match handler.handle(envelope).await {
                Ok(()) => {
                    self.record_processed(envelope).await;
                    metrics::counter!("consumer.handled", "event_type" => envelope.event_type().to_string())
                        .increment(1);
                    return;
                },
                Err(err) if err.class.is_retryable() && attempt < self.retry_max => {
                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        consumer = %self.consumer,
                        event_id = %envelope.event_id(),
                        attempt,
                        class = %err.class,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Handler failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => {
                    self.dead_letter(envelope, &err, attempt + 1).await;
                    return;
                },
            }
        }
    }

    async fn record_processed(&self, envelope: &EventEnvelope) {
        match self
            .processed
            .mark_if_new(&self.consumer, envelope.event_id(), envelope.aggregate_id())
            .await
        {
            Ok(true) => {},
            Ok(false) => {
                tracing::debug!(
                    event_id = %envelope.event_id(),
                    "Event was concurrently recorded as processed"
                );
            },
            Err(e) => {
                tracing::warn!(
                    event_id = %envelope.event_id(),
                    error = %e,
                    "Failed to record processed event (redelivery will be deduplicated by handlers)"
                );
            },
        }
    }

    async fn dead_letter(&self, envelope: &EventEnvelope, err: &HandlerError, attempts: u32) {
        tracing::error!(
            consumer = %self.consumer,
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            class = %err.class,
            attempts,
            error = %err,
            "Handler failed terminally, dead-lettering"
        );
        metrics::counter!("consumer.dead_lettered", "class" => err.class.as_str()).increment(1);

        let payload = codec::encode(envelope).unwrap_or_default();
        let letter = DeadLetter::from_envelope(
            envelope,
            payload,
            err.message.clone(),
            err.details.clone(),
            attempts,
            self.clock.now(),
        );
        if let Err(sink_err) = self.dead_letters.push(letter).await {
            tracing::error!(
                event_id = %envelope.event_id(),
                error = %sink_err,
                "Dead-letter sink rejected handler failure"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use ordermesh_core::events::{EventPayload, OrderFailed};
    use ordermesh_core::ids::{CorrelationId, EventId, OrderId};
    use ordermesh_core::ports::{DeadLetterError, ProcessedLogError};
    use ordermesh_core::Version;
    use std::collections::HashSet;
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

    #[derive(Default)]
    struct MemoryLog {
        seen: Mutex<HashSet<(String, EventId)>>,
    }

    impl ProcessedEventLog for MemoryLog {
        fn already_processed(
            &self,
            consumer: &str,
            event_id: EventId,
        ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
            let key = (consumer.to_string(), event_id);
            Box::pin(async move {
                Ok(self
                    .seen
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .contains(&key))
            })
        }

        fn mark_if_new(
            &self,
            consumer: &str,
            event_id: EventId,
            _aggregate_id: &str,
        ) -> PortFuture<'_, Result<bool, ProcessedLogError>> {
            let key = (consumer.to_string(), event_id);
            Box::pin(async move {
                Ok(self
                    .seen
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(key))
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

    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<HandlerError>,
        fail_times: usize,
    }

    impl CountingHandler {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
                fail_times: 0,
            }
        }

        fn failing(err: HandlerError, times: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(err),
                fail_times: times,
            }
        }
    }

    impl EventHandler for CountingHandler {
        fn handle(&self, _envelope: &EventEnvelope) -> PortFuture<'_, Result<(), HandlerError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                match &self.fail_with {
                    Some(err) if call < self.fail_times => Err(err.clone()),
                    _ => Ok(()),
                }
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
            .max_retries(3)
            .initial_delay(Duration::from_millis(2))
            .jitter(false)
            .build()
    }

    fn dispatcher(
        handler: Arc<CountingHandler>,
        log: Arc<MemoryLog>,
        sink: Arc<RecordingSink>,
    ) -> Dispatcher {
        Dispatcher::new(
            "test-consumer",
            log as Arc<dyn ProcessedEventLog>,
            sink as Arc<dyn DeadLetterSink>,
            Arc::new(FixedClock),
        )
        .with_retry(3, tight_policy())
        .register("OrderFailed.v1", handler as Arc<dyn EventHandler>)
    }

    #[tokio::test]
    async fn handles_and_records() {
        let handler = Arc::new(CountingHandler::succeeding());
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(Arc::clone(&handler), Arc::clone(&log), Arc::clone(&sink));

        let env = envelope();
        dispatcher.process(&env).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(log
            .already_processed("test-consumer", env.event_id())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn redelivery_produces_no_second_side_effect() {
        let handler = Arc::new(CountingHandler::succeeding());
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(Arc::clone(&handler), log, sink);

        let env = envelope();
        dispatcher.process(&env).await;
        dispatcher.process(&env).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let handler = Arc::new(CountingHandler::failing(
            HandlerError::transient("db timeout"),
            2,
        ));
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(Arc::clone(&handler), log, Arc::clone(&sink));

        dispatcher.process(&envelope()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(sink.letters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn business_rule_failures_dead_letter_without_retry() {
        let handler = Arc::new(CountingHandler::failing(
            HandlerError::business_rule("invalid transition"),
            usize::MAX,
        ));
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(Arc::clone(&handler), Arc::clone(&log), Arc::clone(&sink));

        let env = envelope();
        dispatcher.process(&env).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1, "no retry");
        let letters = sink.letters.lock().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].retry_count, 1);
        // A dead-lettered event is not recorded as processed.
        assert!(!log
            .already_processed("test-consumer", env.event_id())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn transient_exhaustion_dead_letters() {
        let handler = Arc::new(CountingHandler::failing(
            HandlerError::transient("lock contention"),
            usize::MAX,
        ));
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = dispatcher(Arc::clone(&handler), log, Arc::clone(&sink));

        dispatcher.process(&envelope()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4); // Initial + 3 retries
        assert_eq!(sink.letters.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_event_types_are_skipped() {
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(
            "test-consumer",
            Arc::clone(&log) as Arc<dyn ProcessedEventLog>,
            Arc::clone(&sink) as Arc<dyn DeadLetterSink>,
            Arc::new(FixedClock),
        );

        let env = envelope();
        dispatcher.process(&env).await;

        assert!(sink.letters.lock().unwrap().is_empty());
        assert!(!log
            .already_processed("test-consumer", env.event_id())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn fatal_stream_errors_are_dead_lettered() {
        let log = Arc::new(MemoryLog::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(
            "test-consumer",
            log as Arc<dyn ProcessedEventLog>,
            Arc::clone(&sink) as Arc<dyn DeadLetterSink>,
            Arc::new(FixedClock),
        );

        dispatcher
            .handle_stream_error(&EventBusError::DeserializationFailed(
                "unknown tag".to_string(),
            ))
            .await;

        assert_eq!(sink.letters.lock().unwrap().len(), 1);
    }
}
