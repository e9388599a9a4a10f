//! # User Service Testing
//!
//! In-memory collaborators for fast, deterministic tests of the user service.
//!
//! This crate provides:
//! - [`InMemoryUserStore`]: store with outbox, call counters and failure injection
//! - [`InMemoryProjectionCache`]: expiring cache with call counters and failure injection
//! - [`InMemoryLog`]: single-partition log with committed offsets and redelivery
//!
//! ## Example
//!
//! ```ignore
//! use user_service_testing::{InMemoryLog, InMemoryUserStore};
//! use user_service_core::event::LifecycleEvent;
//!
//! #[tokio::test]
//! async fn test_registration_flow() {
//!     let log = InMemoryLog::new("auth");
//!     log.append_event(&LifecycleEvent::registered("alice"));
//!
//!     let store = InMemoryUserStore::new();
//!     // run a sync consumer over log.consumer() and store ...
//!     assert_eq!(store.users_named("alice").len(), 1);
//! }
//! ```

/// In-memory projection cache
pub mod cache;

/// In-memory partition log
pub mod log;

/// In-memory user store
pub mod store;

pub use cache::InMemoryProjectionCache;
pub use log::{InMemoryLog, InMemoryLogConsumer};
pub use store::{InMemoryUserStore, StoreOp};
