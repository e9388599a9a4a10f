//! Inbound account lifecycle events.
//!
//! The upstream identity system publishes one [`LifecycleEvent`] per account
//! registration or deletion on the `auth` topic. Each message carries a
//! [`MESSAGE_TYPE_HEADER`] whose value fingerprints the payload schema; only
//! messages fingerprinted [`LifecycleEvent::FINGERPRINT`] are decoded.
//!
//! Payloads are `bincode`-encoded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header key carrying the payload type fingerprint.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// Kind of account change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Producer did not set a change type.
    Unspecified,
    /// An account was registered.
    Registered,
    /// An account was deleted.
    Deleted,
}

impl ChangeType {
    /// Stable name for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Registered => "registered",
            Self::Deleted => "deleted",
        }
    }
}

/// Account lifecycle notification from the identity system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened to the account.
    pub change_type: ChangeType,
    /// Natural key of the account.
    pub username: String,
}

impl LifecycleEvent {
    /// Type fingerprint carried in [`MESSAGE_TYPE_HEADER`].
    pub const FINGERPRINT: &'static str = "auth.v1.ChangedEvent";

    /// A `registered` event.
    #[must_use]
    pub fn registered(username: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Registered,
            username: username.into(),
        }
    }

    /// A `deleted` event.
    #[must_use]
    pub fn deleted(username: impl Into<String>) -> Self {
        Self {
            change_type: ChangeType::Deleted,
            username: username.into(),
        }
    }

    /// Encode to the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Decode from the wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if the payload is not a valid event.
    pub fn decode(payload: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(payload).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Wire format failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event.
    #[error("failed to serialize payload: {0}")]
    Encode(String),

    /// Failed to deserialize a payload.
    #[error("failed to deserialize payload: {0}")]
    Decode(String),
}
