//! # User Service Runtime
//!
//! Runtime support shared by the user service binaries.
//!
//! ## Core Components
//!
//! - **Retry**: exponential backoff bounded by elapsed time, cancellable
//! - **Supervisor**: named tasks sharing one cancellation token
//! - **Metrics**: Prometheus recorder and metric names

/// Retry logic with exponential backoff
pub mod retry;

/// Task supervision with shared cancellation
pub mod supervisor;

/// Prometheus metrics for observability
pub mod metrics;

pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use supervisor::{Supervisor, SupervisorError};
