//! # User Service Core
//!
//! Entity model and collaborator contracts for the user-record subsystem.
//!
//! The user service owns the canonical state of user accounts. It is kept in
//! sync with the upstream identity system through a stream of lifecycle events
//! and serves short projections through a read-through cache.
//!
//! ## Modules
//!
//! - [`user`]: `UserId`, `User`, `UserShortProjection` and field validation
//! - [`event`]: inbound lifecycle events and their wire format
//! - [`outbox`]: pending-change rows written atomically with every mutation
//! - [`context`]: per-operation context (correlation id, caller, deadline)
//! - [`error`]: caller-visible service errors
//! - [`store`]: source-of-truth store contract
//! - [`cache`]: projection cache contract
//! - [`broker`]: partitioned-log consumer contract
//!
//! ## Architecture
//!
//! ```text
//!  auth topic ──► LogConsumer ──► change handlers ──► UserStore (row + outbox, one tx)
//!
//!  RPC read ──► ProjectionCache ──(miss)──► UserStore ──► async cache write-back
//! ```
//!
//! Collaborators return tagged errors ([`store::StoreError`],
//! [`cache::CacheError`], [`broker::BrokerError`]) so that callers decide
//! success or failure with a `match`, never by inspecting an error chain.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod cache;
pub mod context;
pub mod error;
pub mod event;
pub mod outbox;
pub mod store;
pub mod user;

pub use context::OperationContext;
pub use error::ServiceError;
pub use user::{User, UserId, UserShortProjection};
