//! In-memory single-partition log with consumer-group offsets.
//!
//! [`InMemoryLog`] plays the broker: messages are appended with consecutive
//! offsets and the group's committed offset survives consumers. Each
//! [`InMemoryLog::consumer`] starts reading at the committed offset, so a
//! message whose offset was never stored is delivered again to the next
//! consumer, exactly as after a process restart.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use user_service_core::broker::{BrokerError, InboundMessage, LogConsumer};
use user_service_core::event::{LifecycleEvent, MESSAGE_TYPE_HEADER};

/// Longest an idle poll sleeps, keeping tests fast.
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Broker {
    messages: Vec<InboundMessage>,
    committed: i64,
    poll_errors: VecDeque<BrokerError>,
    probe_error: Option<BrokerError>,
    probe_delay: Option<Duration>,
    subscribe_error: Option<BrokerError>,
    store_offset_error: Option<BrokerError>,
    close_error: Option<BrokerError>,
    cancel_when_idle: Option<CancellationToken>,
    delivered: Vec<i64>,
    closes: usize,
}

/// In-memory partitioned log with one partition.
#[derive(Clone, Debug)]
pub struct InMemoryLog {
    topic: String,
    broker: Arc<Mutex<Broker>>,
}

impl InMemoryLog {
    /// Create an empty log for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            broker: Arc::new(Mutex::new(Broker::default())),
        }
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message with arbitrary headers; returns its offset.
    pub fn append(&self, key: Option<&str>, headers: Vec<(String, Vec<u8>)>, payload: Vec<u8>) -> i64 {
        let mut broker = self.broker.lock().unwrap();
        let offset = i64::try_from(broker.messages.len()).unwrap();
        broker.messages.push(InboundMessage {
            topic: self.topic.clone(),
            partition: 0,
            offset,
            key: key.map(|key| key.as_bytes().to_vec()),
            headers,
            payload,
        });
        offset
    }

    /// Append `event` with the lifecycle fingerprint header; returns its offset.
    pub fn append_event(&self, event: &LifecycleEvent) -> i64 {
        self.append(
            Some(&event.username),
            vec![(
                MESSAGE_TYPE_HEADER.to_string(),
                LifecycleEvent::FINGERPRINT.as_bytes().to_vec(),
            )],
            event.encode().unwrap(),
        )
    }

    /// Append a message carrying `message_type` in its type header.
    pub fn append_typed(&self, message_type: &str, payload: Vec<u8>) -> i64 {
        self.append(
            None,
            vec![(MESSAGE_TYPE_HEADER.to_string(), message_type.as_bytes().to_vec())],
            payload,
        )
    }

    /// Group offset: the next offset a new consumer reads.
    #[must_use]
    pub fn committed_offset(&self) -> i64 {
        self.broker.lock().unwrap().committed
    }

    /// Offsets handed out by `poll`, across all consumers, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<i64> {
        self.broker.lock().unwrap().delivered.clone()
    }

    /// How many consumers were closed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.broker.lock().unwrap().closes
    }

    /// Queue an error returned by the next `poll` instead of a message.
    pub fn push_poll_error(&self, error: BrokerError) {
        self.broker.lock().unwrap().poll_errors.push_back(error);
    }

    /// Make `probe` fail.
    pub fn fail_probe(&self, error: BrokerError) {
        self.broker.lock().unwrap().probe_error = Some(error);
    }

    /// Make `probe` take `delay` before answering.
    pub fn delay_probe(&self, delay: Duration) {
        self.broker.lock().unwrap().probe_delay = Some(delay);
    }

    /// Make `subscribe` fail.
    pub fn fail_subscribe(&self, error: BrokerError) {
        self.broker.lock().unwrap().subscribe_error = Some(error);
    }

    /// Make every `store_offset` fail.
    pub fn fail_store_offset(&self, error: BrokerError) {
        self.broker.lock().unwrap().store_offset_error = Some(error);
    }

    /// Make `close` fail after committing.
    pub fn fail_close(&self, error: BrokerError) {
        self.broker.lock().unwrap().close_error = Some(error);
    }

    /// Cancel `token` the first time a consumer finds no message to deliver.
    pub fn cancel_when_idle(&self, token: CancellationToken) {
        self.broker.lock().unwrap().cancel_when_idle = Some(token);
    }

    /// A new group member reading from the committed offset.
    #[must_use]
    pub fn consumer(&self) -> InMemoryLogConsumer {
        let position = self.committed_offset();
        InMemoryLogConsumer {
            log: self.clone(),
            position: Mutex::new(position),
            stored: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
        }
    }
}

/// Group member of an [`InMemoryLog`].
#[derive(Debug)]
pub struct InMemoryLogConsumer {
    log: InMemoryLog,
    position: Mutex<i64>,
    stored: Mutex<Option<i64>>,
    subscribed: AtomicBool,
    polls: AtomicUsize,
}

impl InMemoryLogConsumer {
    /// Next offset this consumer will commit on close, if any was stored.
    #[must_use]
    pub fn stored_offset(&self) -> Option<i64> {
        *self.stored.lock().unwrap()
    }

    /// Number of `poll` calls.
    #[must_use]
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl LogConsumer for InMemoryLogConsumer {
    async fn probe(&self, topic: &str, timeout: Duration) -> Result<(), BrokerError> {
        let (error, delay) = {
            let broker = self.log.broker.lock().unwrap();
            (broker.probe_error.clone(), broker.probe_delay)
        };
        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(BrokerError::timeout(format!("metadata for {topic} timed out")));
            }
            tokio::time::sleep(delay).await;
        }
        error.map_or(Ok(()), Err)
    }

    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if let Some(error) = self.log.broker.lock().unwrap().subscribe_error.clone() {
            return Err(error);
        }
        if topic != self.log.topic {
            return Err(BrokerError::fatal(format!("unknown topic {topic}")));
        }
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(BrokerError::fatal("poll before subscribe"));
        }

        let cancel = {
            let mut broker = self.log.broker.lock().unwrap();
            if let Some(error) = broker.poll_errors.pop_front() {
                return Err(error);
            }
            let mut position = self.position.lock().unwrap();
            let next = usize::try_from(*position)
                .ok()
                .and_then(|index| broker.messages.get(index))
                .cloned();
            if let Some(message) = next {
                *position += 1;
                broker.delivered.push(message.offset);
                return Ok(Some(message));
            }
            broker.cancel_when_idle.take()
        };

        if let Some(token) = cancel {
            token.cancel();
        }
        tokio::time::sleep(timeout.min(IDLE_POLL)).await;
        Ok(None)
    }

    fn store_offset(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        if let Some(error) = self.log.broker.lock().unwrap().store_offset_error.clone() {
            return Err(error);
        }
        *self.stored.lock().unwrap() = Some(message.offset + 1);
        Ok(())
    }

    async fn close(self) -> Result<(), BrokerError> {
        let stored = self.stored_offset();
        let mut broker = self.log.broker.lock().unwrap();
        broker.closes += 1;
        if let Some(next) = stored {
            broker.committed = broker.committed.max(next);
        }
        broker.close_error.clone().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unstored_messages_are_redelivered_to_the_next_consumer() {
        let log = InMemoryLog::new("auth");
        log.append_event(&LifecycleEvent::registered("alice"));
        log.append_event(&LifecycleEvent::registered("bob"));

        let first = log.consumer();
        first.subscribe("auth").unwrap();
        let m0 = first.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        first.store_offset(&m0).unwrap();
        let m1 = first.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(m1.offset, 1);
        first.close().await.unwrap();
        assert_eq!(log.committed_offset(), 1);

        let second = log.consumer();
        second.subscribe("auth").unwrap();
        let again = second.poll(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(again.offset, 1);
        assert_eq!(log.delivered(), vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn idle_poll_cancels_once_and_returns_none() {
        let log = InMemoryLog::new("auth");
        let token = CancellationToken::new();
        log.cancel_when_idle(token.clone());

        let consumer = log.consumer();
        consumer.subscribe("auth").unwrap();
        assert!(consumer.poll(Duration::from_millis(100)).await.unwrap().is_none());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn queued_poll_errors_come_first() {
        let log = InMemoryLog::new("auth");
        log.append_typed("other", Vec::new());
        log.push_poll_error(BrokerError::transient("rebalance"));

        let consumer = log.consumer();
        consumer.subscribe("auth").unwrap();
        assert!(consumer.poll(Duration::from_millis(1)).await.is_err());
        assert!(consumer.poll(Duration::from_millis(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn slow_probe_times_out() {
        let log = InMemoryLog::new("auth");
        log.delay_probe(Duration::from_secs(5));
        let err = log
            .consumer()
            .probe("auth", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
