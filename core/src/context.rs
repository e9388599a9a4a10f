//! Per-operation context passed explicitly through every call.
//!
//! An [`OperationContext`] carries the correlation id used in log records, the
//! authenticated caller (if any) and an optional deadline. Store and cache
//! implementations bound their I/O by [`OperationContext::within_deadline`].

use crate::user::UserId;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// The operation ran past its deadline.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation deadline exceeded")]
pub struct DeadlineExceeded;

/// Request/operation scoped context.
#[derive(Clone, Debug)]
pub struct OperationContext {
    correlation_id: Uuid,
    caller: Option<UserId>,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// A context with a fresh correlation id, no caller and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            caller: None,
            deadline: None,
        }
    }

    /// Use an existing correlation id (e.g. from an inbound request header).
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attach the authenticated caller.
    #[must_use]
    pub const fn with_caller(mut self, caller: UserId) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Bound the operation to at most `timeout` from now.
    ///
    /// An existing earlier deadline is kept.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    /// Correlation id for log records.
    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Authenticated caller, if any.
    #[must_use]
    pub const fn caller(&self) -> Option<UserId> {
        self.caller
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Run `fut`, giving up when the deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineExceeded`] if the deadline elapses first.
    pub async fn within_deadline<F>(&self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(fut.await),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn with_timeout_keeps_earlier_deadline() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(10));
        let first = ctx.deadline().expect("deadline set");
        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test]
    async fn within_deadline_times_out() {
        let ctx = OperationContext::new().with_timeout(Duration::from_millis(5));
        let result = ctx
            .within_deadline(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));
    }

    #[tokio::test]
    async fn unbounded_context_runs_to_completion() {
        let ctx = OperationContext::new();
        assert!(ctx.remaining().is_none());
        assert_eq!(ctx.within_deadline(async { 7 }).await, Ok(7));
    }
}
