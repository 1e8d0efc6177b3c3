//! Kafka-compatible event transport for ordermesh.
//!
//! Implements the core [`EventPublisher`] and [`EventSubscriber`] ports
//! over rdkafka. Works against Redpanda, Apache Kafka, or any
//! Kafka-protocol broker.
//!
//! # Delivery contract
//!
//! - **Publisher**: `acks=all` (quorum replication before the ack),
//!   `enable.idempotence=true` (retries cannot duplicate broker records),
//!   snappy compression, 30 s send timeout. Records are keyed by the
//!   envelope's aggregate id, so one aggregate's events land in one
//!   partition and are observed in production order. Envelope headers are
//!   stamped as Kafka record headers for broker-side tooling.
//! - **Subscriber**: consumer groups with `enable.auto.commit=false`;
//!   offsets are committed only after the decoded envelope was handed to
//!   the downstream channel. At-least-once: a crash before the commit
//!   re-delivers, and consumers deduplicate on the processed-event log.
//! - Bytes that fail to decode are surfaced as fatal stream errors (the
//!   dispatcher dead-letters them) and committed so a poison message
//!   cannot wedge the partition.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use ordermesh_core::codec;
use ordermesh_core::ports::{EnvelopeStream, EventBusError, EventPublisher, EventSubscriber, PortFuture};
use ordermesh_core::EventEnvelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Default broker publish timeout. Independent of any caller deadline: a
/// broker write is never abandoned mid-flight.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Kafka-backed event bus.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// [`EventBusError::ConnectionFailed`] when the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Override the producer acknowledgement mode. Default: `all`.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Override the compression codec. Default: `snappy`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Override the publish timeout. Default: 30 s.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group id. When unset, subscriptions derive a group
    /// from their sorted topic list.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the subscriber buffer size. Default: 1000.
    ///
    /// # Panics
    ///
    /// Panics when `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where new consumer groups start reading. Default: `latest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// [`EventBusError::ConnectionFailed`] when brokers are unset or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;

        let acks = self.acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "snappy".to_string());
        let timeout = self.timeout.unwrap_or(PUBLISH_TIMEOUT);

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", "true")
            .set("compression.type", &compression);

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            idempotence = true,
            timeout_ms = timeout.as_millis(),
            "Redpanda event bus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
        })
    }
}

/// Stamp the envelope metadata as Kafka record headers.
fn envelope_headers(envelope: &EventEnvelope) -> OwnedHeaders {
    use rdkafka::message::Header;
    OwnedHeaders::new()
        .insert(Header {
            key: "eventId",
            value: Some(&envelope.event_id().to_string()),
        })
        .insert(Header {
            key: "eventType",
            value: Some(envelope.event_type()),
        })
        .insert(Header {
            key: "aggregateId",
            value: Some(envelope.aggregate_id()),
        })
        .insert(Header {
            key: "aggregateType",
            value: Some(envelope.aggregate_type()),
        })
        .insert(Header {
            key: "version",
            value: Some(&envelope.version().to_string()),
        })
        .insert(Header {
            key: "correlationId",
            value: Some(&envelope.correlation_id().to_string()),
        })
        .insert(Header {
            key: "sourceService",
            value: Some(envelope.source_service()),
        })
        .insert(Header {
            key: "occurredAt",
            value: Some(&envelope.occurred_at().to_rfc3339()),
        })
}

impl EventPublisher for RedpandaEventBus {
    fn publish(&self, envelope: &EventEnvelope) -> PortFuture<'_, Result<(), EventBusError>> {
        let envelope = envelope.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let topic = envelope.topic();
            let payload = codec::encode(&envelope).map_err(|e| EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: format!("Failed to encode envelope: {e}"),
            })?;

            // Key on the aggregate id: one aggregate, one partition, one
            // ordering scope.
            let key = envelope.partition_key().to_string();
            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(&key)
                .headers(envelope_headers(&envelope));

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic,
                        partition,
                        offset,
                        event_type = envelope.event_type(),
                        aggregate_id = envelope.aggregate_id(),
                        "Event published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic, error = %kafka_error, "Failed to publish event");
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

impl EventSubscriber for RedpandaEventBus {
    fn subscribe(&self, topics: &[&str]) -> PortFuture<'_, Result<EnvelopeStream, EventBusError>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer_group_id = consumer_group.unwrap_or_else(|| {
                let mut sorted_topics = topics.clone();
                sorted_topics.sort();
                format!("ordermesh-{}", sorted_topics.join("-"))
            });

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topics"
            );

            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The consumer lives in this task; offsets are committed only
            // after the envelope was accepted by the channel.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            let decoded = message.payload().map_or_else(
                                || {
                                    Err(EventBusError::DeserializationFailed(
                                        "Message has no payload".to_string(),
                                    ))
                                },
                                |payload| {
                                    codec::decode(payload).map_err(|e| {
                                        EventBusError::DeserializationFailed(format!(
                                            "topic {} partition {} offset {}: {e}",
                                            message.topic(),
                                            message.partition(),
                                            message.offset()
                                        ))
                                    })
                                },
                            );

                            if let Ok(envelope) = &decoded {
                                tracing::trace!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    event_type = envelope.event_type(),
                                    "Received event"
                                );
                            }

                            if tx.send(decoded).await.is_err() {
                                // Receiver dropped: exit WITHOUT committing
                                // so the message is redelivered.
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }

                            // Commit after delivery: at-least-once.
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        },
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EnvelopeStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;
    use chrono::{DateTime, Utc};
    use ordermesh_core::events::{EventPayload, OrderFailed};
    use ordermesh_core::ids::{CorrelationId, OrderId};
    use ordermesh_core::Version;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn event_bus_is_send_sync() {
        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = RedpandaEventBus::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }

    #[test]
    #[allow(clippy::unwrap_used)] // Test code can use unwrap
    fn headers_carry_the_full_envelope_metadata() {
        let occurred_at: DateTime<Utc> = DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let envelope = EventEnvelope::new(
            EventPayload::OrderFailed(OrderFailed {
                order_id: OrderId::new(),
                reason: "x".to_string(),
                failed_at: occurred_at,
            }),
            Version::new(3),
            CorrelationId::new(),
            "order-service",
            occurred_at,
        );

        let headers = envelope_headers(&envelope);
        let keys: Vec<&str> = (0..headers.count())
            .map(|i| headers.get(i).key)
            .collect();

        for expected in [
            "eventId",
            "eventType",
            "aggregateId",
            "aggregateType",
            "version",
            "correlationId",
            "sourceService",
            "occurredAt",
        ] {
            assert!(keys.contains(&expected), "missing header {expected}");
        }
    }
}
