//! Synchronization consumer: the lifecycle event loop.
//!
//! Messages are processed one at a time in delivery order. The offset of a
//! message is stored only once it was handled successfully or skipped on
//! purpose; a failed message is never acknowledged and is delivered again
//! after restart.
//!
//! | Message | Action |
//! |---------|--------|
//! | no type header | acknowledge |
//! | unknown type | acknowledge |
//! | undecodable lifecycle event | stop with [`ConsumerError::MalformedPayload`] |
//! | `unspecified` change | acknowledge, warn |
//! | `registered` / `deleted` | run handler, acknowledge on success |

use crate::sync::handlers::{ChangeHandlers, HandlerError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use user_service_core::OperationContext;
use user_service_core::broker::{BrokerError, InboundMessage, LogConsumer};
use user_service_core::event::{ChangeType, EventError, LifecycleEvent, MESSAGE_TYPE_HEADER};
use user_service_core::store::UserStore;
use user_service_runtime::metrics::{SyncMetrics, SyncOutcome};
use uuid::Uuid;

/// Poll timeout; bounds how late cancellation is observed.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Probe timeout when the initialization context has no deadline.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Why the consumer stopped.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The broker could not be reached at startup.
    #[error("broker probe failed: {0}")]
    Probe(#[source] BrokerError),

    /// Subscribing to the topic failed.
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] BrokerError),

    /// The broker client reported a non-recoverable error.
    #[error("fatal broker error: {0}")]
    Fatal(#[source] BrokerError),

    /// A lifecycle event could not be decoded.
    #[error("malformed lifecycle event at {topic}/{partition}@{offset}: {source}")]
    MalformedPayload {
        /// Topic of the message
        topic: String,
        /// Partition of the message
        partition: i32,
        /// Offset of the message
        offset: i64,
        /// Decoding failure
        #[source]
        source: EventError,
    },

    /// A handler gave up; the message was not acknowledged.
    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),

    /// Closing the client failed.
    #[error("close failed: {0}")]
    Close(#[source] BrokerError),

    /// The loop failed and closing the client failed too.
    #[error("{run}; close also failed: {close}")]
    RunAndClose {
        /// Error that ended the loop
        run: Box<ConsumerError>,
        /// Error raised while closing
        close: BrokerError,
    },
}

enum Flow {
    Continue,
    Stop,
}

/// Long-lived subscription turning lifecycle events into store mutations.
pub struct SyncConsumer<L, S> {
    consumer: L,
    handlers: ChangeHandlers<S>,
    topic: String,
}

impl<L: LogConsumer, S: UserStore> SyncConsumer<L, S> {
    /// Verify broker connectivity and build the consumer.
    ///
    /// The probe is bounded by the time left until the deadline of `init`, or
    /// [`DEFAULT_PROBE_TIMEOUT`] when it has none.
    ///
    /// # Errors
    ///
    /// [`ConsumerError::Probe`] if the broker is unreachable or the topic
    /// metadata cannot be fetched.
    pub async fn connect(
        init: &OperationContext,
        consumer: L,
        handlers: ChangeHandlers<S>,
        topic: impl Into<String>,
    ) -> Result<Self, ConsumerError> {
        let topic = topic.into();
        let probe_timeout = init.remaining().unwrap_or(DEFAULT_PROBE_TIMEOUT);
        consumer
            .probe(&topic, probe_timeout)
            .await
            .map_err(ConsumerError::Probe)?;
        tracing::info!(topic = %topic, probe_timeout_ms = probe_timeout.as_millis(), "Broker reachable");

        Ok(Self {
            consumer,
            handlers,
            topic,
        })
    }

    /// Topic this consumer reads.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run the poll loop until `cancel` fires or an error stops it, then close
    /// the client.
    ///
    /// # Errors
    ///
    /// The error that stopped the loop, a close failure, or both merged into
    /// [`ConsumerError::RunAndClose`].
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let Self {
            consumer,
            handlers,
            topic,
        } = self;

        let result = consume(&consumer, &handlers, &topic, &cancel).await;
        let closed = consumer.close().await;

        match (result, closed) {
            (Ok(()), Ok(())) => {
                tracing::info!(topic = %topic, "Sync consumer stopped");
                Ok(())
            }
            (Err(run), Ok(())) => Err(run),
            (Ok(()), Err(close)) => Err(ConsumerError::Close(close)),
            (Err(run), Err(close)) => Err(ConsumerError::RunAndClose {
                run: Box::new(run),
                close,
            }),
        }
    }
}

async fn consume<L: LogConsumer, S: UserStore>(
    consumer: &L,
    handlers: &ChangeHandlers<S>,
    topic: &str,
    cancel: &CancellationToken,
) -> Result<(), ConsumerError> {
    consumer.subscribe(topic).map_err(ConsumerError::Subscribe)?;
    tracing::info!(topic, "Sync consumer started");

    loop {
        if cancel.is_cancelled() {
            tracing::info!(topic, "Shutdown requested, leaving poll loop");
            return Ok(());
        }

        let message = match consumer.poll(POLL_TIMEOUT).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(error) if error.is_fatal() => return Err(ConsumerError::Fatal(error)),
            Err(error) => {
                if !error.is_timeout() {
                    tracing::warn!(topic, error = %error, "Broker read failed, polling again");
                }
                continue;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "sync_message",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = %message.key_lossy(),
            correlation_id = %correlation_id,
        );
        let flow = process(consumer, handlers, &message, correlation_id, cancel)
            .instrument(span)
            .await?;
        if matches!(flow, Flow::Stop) {
            return Ok(());
        }
    }
}

async fn process<L: LogConsumer, S: UserStore>(
    consumer: &L,
    handlers: &ChangeHandlers<S>,
    message: &InboundMessage,
    correlation_id: Uuid,
    cancel: &CancellationToken,
) -> Result<Flow, ConsumerError> {
    let Some(fingerprint) = message.header(MESSAGE_TYPE_HEADER) else {
        tracing::debug!("Message without type header, acknowledging");
        acknowledge(consumer, message, SyncOutcome::Skipped);
        return Ok(Flow::Continue);
    };

    if fingerprint != LifecycleEvent::FINGERPRINT.as_bytes() {
        tracing::debug!(
            event_fingerprint = %String::from_utf8_lossy(fingerprint),
            "Unknown message type, acknowledging"
        );
        acknowledge(consumer, message, SyncOutcome::Skipped);
        return Ok(Flow::Continue);
    }

    let event = LifecycleEvent::decode(&message.payload).map_err(|source| {
        SyncMetrics::record_message(SyncOutcome::Failed);
        tracing::error!(
            event_fingerprint = LifecycleEvent::FINGERPRINT,
            error = %source,
            "Malformed lifecycle event"
        );
        ConsumerError::MalformedPayload {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            source,
        }
    })?;

    let ctx = OperationContext::new().with_correlation_id(correlation_id);
    let handled = match event.change_type {
        ChangeType::Registered => handlers.on_registered(&ctx, &event.username, cancel).await,
        ChangeType::Deleted => handlers.on_deleted(&ctx, &event.username, cancel).await,
        ChangeType::Unspecified => {
            tracing::warn!(username = %event.username, "Lifecycle event without change type, acknowledging");
            acknowledge(consumer, message, SyncOutcome::Skipped);
            return Ok(Flow::Continue);
        }
    };

    match handled {
        Ok(()) => {
            acknowledge(consumer, message, SyncOutcome::Applied);
            Ok(Flow::Continue)
        }
        Err(error) if error.is_cancelled() => {
            tracing::info!(
                username = %event.username,
                "Shutdown during handler retries, message left for redelivery"
            );
            Ok(Flow::Stop)
        }
        Err(error) => {
            SyncMetrics::record_message(SyncOutcome::Failed);
            Err(ConsumerError::Handler(error))
        }
    }
}

/// Store the offset of `message`. Failure is logged only: redelivery of an
/// applied change is harmless.
fn acknowledge<L: LogConsumer>(consumer: &L, message: &InboundMessage, outcome: SyncOutcome) {
    SyncMetrics::record_message(outcome);
    if let Err(error) = consumer.store_offset(message) {
        SyncMetrics::record_offset_store_error();
        tracing::warn!(error = %error, "Failed to store offset");
    }
}
