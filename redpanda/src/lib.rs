//! Redpanda/Kafka consumer for the user service.
//!
//! This crate implements the [`LogConsumer`] trait from `user-service-core`
//! with rdkafka's [`StreamConsumer`]:
//!
//! - **Manual offset store**: `enable.auto.offset.store=false`; only offsets the
//!   caller stores are committed (at-least-once)
//! - **Background commit**: stored offsets are committed every
//!   `auto.commit.interval.ms`, and once more synchronously on close
//! - **Fatal classification**: errors are fatal when the client reports a
//!   fatal error, timeouts are reported as such
//!
//! # Example
//!
//! ```no_run
//! use user_service_redpanda::RedpandaLogConsumer;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let consumer = RedpandaLogConsumer::builder()
//!     .brokers("localhost:9092")
//!     .group_id("user-service")
//!     .commit_interval(Duration::from_millis(500))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use user_service_core::broker::{BrokerError, InboundMessage, LogConsumer};

/// Redpanda consumer implementation.
///
/// One instance is one member of a consumer group subscribed to one topic.
pub struct RedpandaLogConsumer {
    consumer: Arc<StreamConsumer>,
    brokers: String,
    group_id: String,
}

impl RedpandaLogConsumer {
    /// Create a builder for configuring the consumer.
    #[must_use]
    pub fn builder() -> RedpandaLogConsumerBuilder {
        RedpandaLogConsumerBuilder::default()
    }

    /// Get the configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Get the consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn classify(&self, err: &KafkaError) -> BrokerError {
        classify(&self.consumer, err)
    }
}

/// Sort a client error into fatal, timeout or transient.
fn classify(consumer: &StreamConsumer, err: &KafkaError) -> BrokerError {
    if let Some((code, reason)) = consumer.client().fatal_error() {
        return BrokerError::fatal(format!("{code}: {reason}"));
    }
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Fatal) => BrokerError::fatal(err.to_string()),
        Some(RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut) => {
            BrokerError::timeout(err.to_string())
        }
        _ => BrokerError::transient(err.to_string()),
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.unwrap_or_default().to_vec(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        headers,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Builder for [`RedpandaLogConsumer`].
#[derive(Default)]
pub struct RedpandaLogConsumerBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    commit_interval: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaLogConsumerBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set how often stored offsets are committed in the background.
    ///
    /// Default: 500ms.
    #[must_use]
    pub const fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = Some(interval);
        self
    }

    /// Set where a group without committed offsets starts reading.
    ///
    /// Default: `"earliest"`, so no lifecycle event is missed by a new group.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6 seconds.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`BrokerError`] if brokers or group id are missing, or
    /// the client rejects the configuration.
    pub fn build(self) -> Result<RedpandaLogConsumer, BrokerError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.is_empty())
            .ok_or_else(|| BrokerError::fatal("Brokers not configured"))?;
        let group_id = self
            .group_id
            .filter(|group| !group.is_empty())
            .ok_or_else(|| BrokerError::fatal("Consumer group not configured"))?;
        let commit_interval = self.commit_interval.unwrap_or(Duration::from_millis(500));
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(6));

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false") // Only handled messages are committed
            .set("auto.commit.interval.ms", commit_interval.as_millis().to_string())
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BrokerError::fatal(format!("Failed to create consumer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            group_id = %group_id,
            commit_interval_ms = commit_interval.as_millis(),
            auto_offset_reset = %auto_offset_reset,
            "RedpandaLogConsumer created successfully"
        );

        Ok(RedpandaLogConsumer {
            consumer: Arc::new(consumer),
            brokers,
            group_id,
        })
    }
}

impl LogConsumer for RedpandaLogConsumer {
    async fn probe(&self, topic: &str, timeout: Duration) -> Result<(), BrokerError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();

        // fetch_metadata blocks the calling thread
        let metadata = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|metadata| metadata.topics().len())
        })
        .await
        .map_err(|e| BrokerError::fatal(format!("Metadata task failed: {e}")))?;

        let topics = metadata.map_err(|e| self.classify(&e))?;
        tracing::debug!(topics, "Broker metadata fetched");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| self.classify(&e))?;
        tracing::info!(topic, group_id = %self.group_id, manual_offset_store = true, "Subscribed to topic");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_inbound(&message))),
            Ok(Err(e)) => Err(self.classify(&e)),
        }
    }

    fn store_offset(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        // The stored offset is the next one to read
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| self.classify(&e))?;
        self.consumer
            .store_offsets(&offsets)
            .map_err(|e| self.classify(&e))
    }

    async fn close(self) -> Result<(), BrokerError> {
        let consumer = self.consumer;
        tokio::task::spawn_blocking(move || {
            let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                Err(e) => Err(classify(&consumer, &e)),
            };
            consumer.unsubscribe();
            committed
        })
        .await
        .map_err(|e| BrokerError::fatal(format!("Close task failed: {e}")))??;

        tracing::info!("Consumer closed");
        Ok(())
    }
}
