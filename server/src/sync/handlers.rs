//! Idempotent handlers for lifecycle events.
//!
//! Each handler converges the store with one upstream change and tolerates
//! redelivery: a duplicate registration finds the user already present, a
//! duplicate deletion finds it already gone. Both outcomes are success.
//!
//! Store calls are retried with exponential backoff under an elapsed-time
//! budget. Every attempt runs under its own timeout, and the backoff sleeps
//! observe the shutdown token.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use user_service_core::OperationContext;
use user_service_core::event::ChangeType;
use user_service_core::store::{StoreError, UserStore};
use user_service_runtime::metrics::SyncMetrics;
use user_service_runtime::{RetryError, RetryPolicy, retry_with_backoff};

/// Retry behaviour of the change handlers.
#[derive(Clone, Debug)]
pub struct HandlerSettings {
    /// Timeout of a single store attempt.
    pub attempt_timeout: Duration,
    /// Backoff between attempts, bounded by elapsed time.
    pub retry: RetryPolicy,
}

impl HandlerSettings {
    /// Default backoff bounded by `max_elapsed`, each attempt bounded by `attempt_timeout`.
    #[must_use]
    pub fn new(attempt_timeout: Duration, max_elapsed: Duration) -> Self {
        Self {
            attempt_timeout,
            retry: RetryPolicy::builder().max_elapsed_time(max_elapsed).build(),
        }
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(120))
    }
}

/// Terminal failure of a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The store kept failing until the retry budget ran out.
    #[error("{change_type} of {username} failed after {attempts} attempts in {elapsed:?}: {source}")]
    RetriesExhausted {
        /// Change being applied
        change_type: &'static str,
        /// Natural key of the user
        username: String,
        /// Attempts made
        attempts: usize,
        /// Time spent retrying
        elapsed: Duration,
        /// Error of the last attempt
        #[source]
        source: StoreError,
    },

    /// Shutdown was requested before the change was applied.
    #[error("{change_type} of {username} cancelled after {attempts} attempts")]
    Cancelled {
        /// Change being applied
        change_type: &'static str,
        /// Natural key of the user
        username: String,
        /// Attempts made
        attempts: usize,
    },
}

impl HandlerError {
    /// `true` if the handler stopped because of shutdown.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Handlers for `registered` and `deleted` lifecycle events.
pub struct ChangeHandlers<S> {
    store: Arc<S>,
    settings: HandlerSettings,
}

impl<S: UserStore> ChangeHandlers<S> {
    /// Handlers mutating `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, settings: HandlerSettings) -> Self {
        Self { store, settings }
    }

    /// Create the user for a `registered` event.
    ///
    /// An existing user with the same username counts as success.
    ///
    /// # Errors
    ///
    /// [`HandlerError::RetriesExhausted`] or [`HandlerError::Cancelled`].
    pub async fn on_registered(
        &self,
        ctx: &OperationContext,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let change_type = ChangeType::Registered.as_str();
        self.apply(change_type, username, cancel, move || async move {
            let attempt = ctx.clone().with_timeout(self.settings.attempt_timeout);
            let created = attempt
                .within_deadline(self.store.create_by_username(&attempt, username))
                .await
                .map_err(StoreError::from)
                .and_then(|result| result);
            match created {
                Ok(id) => {
                    tracing::info!(user_id = %id, username, "User created from registration");
                    Ok(())
                }
                Err(StoreError::AlreadyExists) => {
                    tracing::debug!(username, "User already exists, registration already applied");
                    Ok(())
                }
                Err(error) => {
                    tracing::warn!(username, error = %error, "Failed to create user");
                    Err(error)
                }
            }
        })
        .await
    }

    /// Delete the user for a `deleted` event.
    ///
    /// A user that no longer exists counts as success: a redelivered or
    /// retried deletion has already converged.
    ///
    /// # Errors
    ///
    /// [`HandlerError::RetriesExhausted`] or [`HandlerError::Cancelled`].
    pub async fn on_deleted(
        &self,
        ctx: &OperationContext,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let change_type = ChangeType::Deleted.as_str();
        self.apply(change_type, username, cancel, move || async move {
            let attempt = ctx.clone().with_timeout(self.settings.attempt_timeout);
            let deleted = attempt
                .within_deadline(self.store.delete_by_username(&attempt, username))
                .await
                .map_err(StoreError::from)
                .and_then(|result| result);
            match deleted {
                Ok(id) => {
                    tracing::info!(user_id = %id, username, "User deleted");
                    Ok(())
                }
                Err(StoreError::NotFound) => {
                    tracing::info!(username, "User already absent, deletion already applied");
                    Ok(())
                }
                Err(error) => {
                    tracing::warn!(username, error = %error, "Failed to delete user");
                    Err(error)
                }
            }
        })
        .await
    }

    async fn apply<F, Fut>(
        &self,
        change_type: &'static str,
        username: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<(), HandlerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let started = Instant::now();
        let mut attempts = 0_usize;
        let counted = move || {
            attempts += 1;
            if attempts > 1 {
                SyncMetrics::record_handler_retry(change_type);
            }
            attempt()
        };
        let outcome = retry_with_backoff(&self.settings.retry, cancel, counted).await;
        SyncMetrics::record_handler(change_type, started.elapsed());

        outcome.map_err(|error| {
            let error = match error {
                RetryError::Exhausted {
                    attempts,
                    elapsed,
                    last_error,
                } => HandlerError::RetriesExhausted {
                    change_type,
                    username: username.to_string(),
                    attempts,
                    elapsed,
                    source: last_error,
                },
                RetryError::Cancelled { attempts, .. } => HandlerError::Cancelled {
                    change_type,
                    username: username.to_string(),
                    attempts,
                },
            };
            if !error.is_cancelled() {
                SyncMetrics::record_handler_failure(change_type);
                tracing::error!(username, change_type, error = %error, "Lifecycle change not applied");
            }
            error
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use user_service_core::User;
    use user_service_testing::{InMemoryUserStore, StoreOp};

    fn fast_settings() -> HandlerSettings {
        HandlerSettings {
            attempt_timeout: Duration::from_millis(50),
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .randomization_factor(0.0)
                .max_elapsed_time(Duration::from_millis(200))
                .build(),
        }
    }

    fn handlers() -> (ChangeHandlers<InMemoryUserStore>, Arc<InMemoryUserStore>) {
        let store = Arc::new(InMemoryUserStore::new());
        (ChangeHandlers::new(Arc::clone(&store), fast_settings()), store)
    }

    #[tokio::test]
    async fn registration_of_existing_user_succeeds_without_retry() {
        let (handlers, store) = handlers();
        store.seed(User::registered("alice"));

        handlers
            .on_registered(&OperationContext::new(), "alice", &CancellationToken::new())
            .await
            .expect("duplicate registration is a no-op");

        assert_eq!(store.calls(StoreOp::Create), 1);
        assert_eq!(store.users_named("alice").len(), 1);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let (handlers, store) = handlers();
        store.fail_times(StoreOp::Create, StoreError::Internal("contention".into()), 2);

        handlers
            .on_registered(&OperationContext::new(), "alice", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.calls(StoreOp::Create), 3);
        assert_eq!(store.users_named("alice").len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_the_budget() {
        let (handlers, store) = handlers();
        store.fail_always(StoreOp::Create, StoreError::Internal("down".into()));

        let error = handlers
            .on_registered(&OperationContext::new(), "alice", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            HandlerError::RetriesExhausted { ref username, source: StoreError::Internal(_), .. }
                if username == "alice"
        ));
        assert!(store.calls(StoreOp::Create) > 1);
    }

    #[tokio::test]
    async fn delete_of_unknown_username_is_treated_as_converged() {
        let (handlers, store) = handlers();

        handlers
            .on_deleted(&OperationContext::new(), "ghost", &CancellationToken::new())
            .await
            .expect("deleting a missing user converges");

        assert_eq!(store.calls(StoreOp::Delete), 1);
        assert!(store.outbox().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_existing_user() {
        let (handlers, store) = handlers();
        store.seed(User::registered("alice"));

        handlers
            .on_deleted(&OperationContext::new(), "alice", &CancellationToken::new())
            .await
            .unwrap();

        assert!(store.users_named("alice").is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_retries() {
        let store = Arc::new(InMemoryUserStore::new());
        store.fail_always(StoreOp::Create, StoreError::Internal("down".into()));
        let settings = HandlerSettings {
            attempt_timeout: Duration::from_millis(50),
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(30))
                .max_elapsed_time(Duration::from_secs(600))
                .build(),
        };
        let handlers = ChangeHandlers::new(Arc::clone(&store), settings);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let error = tokio::time::timeout(
            Duration::from_secs(5),
            handlers.on_registered(&OperationContext::new(), "alice", &cancel),
        )
        .await
        .expect("cancellation should end the retry sleep")
        .unwrap_err();

        assert!(error.is_cancelled());
        assert_eq!(store.calls(StoreOp::Create), 1);
    }
}
