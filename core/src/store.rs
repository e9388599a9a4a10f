//! Source-of-truth store contract.
//!
//! The store is a durable relational database. Every mutating call that
//! creates or deletes a user also appends one [`PendingChange`] row in the same
//! transaction, so the outbox never disagrees with the `users` table.
//!
//! [`PendingChange`]: crate::outbox::PendingChange

use crate::context::{DeadlineExceeded, OperationContext};
use crate::user::{User, UserId, UserShortProjection};
use std::future::Future;
use thiserror::Error;

/// Tagged outcome of a failed store call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint (id or username) rejected the write.
    #[error("record already exists")]
    AlreadyExists,

    /// No row matched.
    #[error("record not found")]
    NotFound,

    /// Connection, query or transaction failure.
    #[error("store error: {0}")]
    Internal(String),
}

impl From<DeadlineExceeded> for StoreError {
    fn from(err: DeadlineExceeded) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Durable user storage.
///
/// Implementations are cheap to share (`Arc` or internally pooled) and safe
/// for concurrent use by the synchronization and read paths.
pub trait UserStore: Send + Sync + 'static {
    /// Insert `user` and a `create` outbox row atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyExists`] if the id or username is taken
    /// - [`StoreError::Internal`] on any other failure (nothing is written)
    fn create(
        &self,
        ctx: &OperationContext,
        user: &User,
    ) -> impl Future<Output = Result<UserId, StoreError>> + Send;

    /// Create a freshly registered user for `username`.
    ///
    /// # Errors
    ///
    /// Same as [`UserStore::create`].
    fn create_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> impl Future<Output = Result<UserId, StoreError>> + Send {
        let user = User::registered(username);
        async move { self.create(ctx, &user).await }
    }

    /// Remove the user with `username` and append a `delete` outbox row atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no such user exists (nothing is written)
    /// - [`StoreError::Internal`] on any other failure
    fn delete_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> impl Future<Output = Result<UserId, StoreError>> + Send;

    /// Load the full user record.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Internal`].
    fn get_one(
        &self,
        ctx: &OperationContext,
        id: UserId,
    ) -> impl Future<Output = Result<User, StoreError>> + Send;

    /// Load the short projection of a user.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Internal`].
    fn get_one_projection(
        &self,
        ctx: &OperationContext,
        id: UserId,
    ) -> impl Future<Output = Result<UserShortProjection, StoreError>> + Send;

    /// Load the short projection of a user by natural key.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Internal`].
    fn get_projection_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> impl Future<Output = Result<UserShortProjection, StoreError>> + Send;

    /// Load projections for every id in `ids` that exists, in one query.
    ///
    /// Missing ids are silently absent from the result.
    ///
    /// # Errors
    ///
    /// [`StoreError::Internal`].
    fn get_many_projections(
        &self,
        ctx: &OperationContext,
        ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<UserShortProjection>, StoreError>> + Send;

    /// Overwrite the mutable fields of an existing user.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the user does not exist, otherwise
    /// [`StoreError::Internal`].
    fn update(
        &self,
        ctx: &OperationContext,
        user: &User,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
