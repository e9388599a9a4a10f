//! Partitioned-log consumer contract.
//!
//! A [`LogConsumer`] delivers messages of one subscribed topic in partition
//! order. Offsets are stored explicitly with [`LogConsumer::store_offset`]
//! after a message has been handled; the client commits stored offsets in the
//! background and once more on [`LogConsumer::close`]. Anything not stored is
//! redelivered to the consumer group after a restart (at-least-once).

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// One message read from the log, detached from the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partitioning key.
    pub key: Option<Vec<u8>>,
    /// Message headers in wire order.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Value of the first header named `key`.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_slice())
    }

    /// Key rendered for logs.
    #[must_use]
    pub fn key_lossy(&self) -> String {
        self.key
            .as_deref()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default()
    }
}

/// Severity of a broker failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// The client is unusable; the process must restart.
    Fatal,
    /// Recoverable; keep polling.
    Transient,
    /// The operation timed out; expected while idle.
    Timeout,
}

impl fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fatal => "fatal",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
        })
    }
}

/// Failure reported by the broker client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} broker error: {message}")]
pub struct BrokerError {
    /// Severity.
    pub kind: BrokerErrorKind,
    /// Client-provided description.
    pub message: String,
}

impl BrokerError {
    /// A fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// A recoverable error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// `true` if the client cannot continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Fatal)
    }

    /// `true` for a plain timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Timeout)
    }
}

/// Consumer of one topic of a partitioned log.
pub trait LogConsumer: Send + Sync + 'static {
    /// Verify connectivity by fetching metadata for `topic` within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable or metadata cannot be fetched.
    fn probe(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Join the consumer group for `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription is rejected.
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next message; `Ok(None)` when none arrived.
    ///
    /// # Errors
    ///
    /// Returns the client error, classified by [`BrokerErrorKind`].
    fn poll(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<InboundMessage>, BrokerError>> + Send;

    /// Mark `message` as processed so its offset is committed.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset could not be stored.
    fn store_offset(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Commit stored offsets and leave the group.
    ///
    /// # Errors
    ///
    /// Returns an error if the final commit fails.
    fn close(self) -> impl Future<Output = Result<(), BrokerError>> + Send
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_returns_first_match() {
        let message = InboundMessage {
            topic: "auth".to_string(),
            partition: 0,
            offset: 3,
            key: Some(b"alice".to_vec()),
            headers: vec![
                ("trace".to_string(), b"x".to_vec()),
                ("message-type".to_string(), b"a".to_vec()),
                ("message-type".to_string(), b"b".to_vec()),
            ],
            payload: Vec::new(),
        };
        assert_eq!(message.header("message-type"), Some(&b"a"[..]));
        assert_eq!(message.header("missing"), None);
        assert_eq!(message.key_lossy(), "alice");
    }

    #[test]
    fn error_classification() {
        assert!(BrokerError::fatal("x").is_fatal());
        assert!(BrokerError::timeout("x").is_timeout());
        let transient = BrokerError::transient("x");
        assert!(!transient.is_fatal() && !transient.is_timeout());
    }
}
