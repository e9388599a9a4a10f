//! Lifecycle synchronization: the consumer loop and its change handlers.

pub mod consumer;
pub mod handlers;

pub use consumer::{ConsumerError, SyncConsumer};
pub use handlers::{ChangeHandlers, HandlerError, HandlerSettings};
