//! User service: store operations and the cache-aside projection read path.
//!
//! Reads of short projections consult the [`ProjectionCache`] first and fall
//! back to the [`UserStore`] on a miss or a cache failure. Store results are
//! repaired into the cache in the background through [`WriteBack`]; callers
//! never wait on it.
//!
//! Access to a full user record is gated: the caller in the
//! [`OperationContext`] must be the target user. The gate runs before any I/O.

use crate::write_back::WriteBack;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use user_service_core::cache::{BatchLookup, CacheError, ProjectionCache};
use user_service_core::error::Result;
use user_service_core::store::UserStore;
use user_service_core::{OperationContext, ServiceError, User, UserId, UserShortProjection};
use user_service_runtime::metrics::{CacheMetrics, StoreMetrics};

/// Tunables of the projection read path.
#[derive(Clone, Copy, Debug)]
pub struct ServiceSettings {
    /// Lifetime of repaired cache entries.
    pub cache_ttl: Duration,
    /// Capacity of the write-back queue.
    pub write_back_capacity: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            write_back_capacity: 1024,
        }
    }
}

/// User service over a store and a projection cache.
pub struct UserService<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    write_back: WriteBack,
}

impl<S, C> Clone for UserService<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            write_back: self.write_back.clone(),
        }
    }
}

impl<S: UserStore, C: ProjectionCache> UserService<S, C> {
    /// Create the service and start its write-back worker.
    ///
    /// Must be called inside a tokio runtime. The returned handle completes
    /// once every clone of the service is dropped.
    pub fn new(store: Arc<S>, cache: Arc<C>, settings: ServiceSettings) -> (Self, JoinHandle<()>) {
        let (write_back, worker) = WriteBack::spawn(
            Arc::clone(&cache),
            settings.cache_ttl,
            settings.write_back_capacity,
        );
        (
            Self {
                store,
                cache,
                write_back,
            },
            worker,
        )
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a freshly registered user.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AlreadyExists`] if the username is taken.
    pub async fn create_by_username(&self, ctx: &OperationContext, username: &str) -> Result<UserId> {
        let id = self.store.create_by_username(ctx, username).await?;
        tracing::info!(user_id = %id, username, correlation_id = %ctx.correlation_id(), "User created");
        Ok(id)
    }

    /// Delete the user with `username`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if no such user exists.
    pub async fn delete_by_username(&self, ctx: &OperationContext, username: &str) -> Result<UserId> {
        let id = self.store.delete_by_username(ctx, username).await?;
        tracing::info!(user_id = %id, username, correlation_id = %ctx.correlation_id(), "User deleted");
        Ok(id)
    }

    /// Overwrite the mutable fields of the caller's own record.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::PermissionDenied`] unless the caller is `user.id`
    /// - [`ServiceError::InvalidArgument`] if a field is out of range
    /// - [`ServiceError::NotFound`] if the user does not exist
    pub async fn update(&self, ctx: &OperationContext, user: &User) -> Result<()> {
        authorize(ctx, user.id)?;
        user.validate()
            .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
        self.store.update(ctx, user).await?;
        tracing::debug!(user_id = %user.id, correlation_id = %ctx.correlation_id(), "User updated");
        Ok(())
    }

    /// Load the caller's own full record.
    ///
    /// # Errors
    ///
    /// [`ServiceError::PermissionDenied`] unless the caller is `id`, otherwise
    /// [`ServiceError::NotFound`] or [`ServiceError::Internal`].
    pub async fn get(&self, ctx: &OperationContext, id: UserId) -> Result<User> {
        authorize(ctx, id)?;
        Ok(self.store.get_one(ctx, id).await?)
    }

    /// Short projection by id, served from the cache when possible.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the user does not exist, or
    /// [`ServiceError::Internal`] if the store fallback failed.
    pub async fn get_short_projection(
        &self,
        ctx: &OperationContext,
        id: UserId,
    ) -> Result<UserShortProjection> {
        match self.cache.get_one(id).await {
            Ok(projection) => {
                CacheMetrics::record_hits(1);
                return Ok(projection);
            }
            Err(CacheError::NotFound) => CacheMetrics::record_misses(1),
            Err(error) => {
                CacheMetrics::record_error();
                tracing::error!(
                    user_id = %id,
                    correlation_id = %ctx.correlation_id(),
                    error = %error,
                    "Projection cache lookup failed, reading from store"
                );
            }
        }

        let projection = self.store.get_one_projection(ctx, id).await?;
        StoreMetrics::record_fallback_read();
        self.write_back.submit(projection.clone());
        Ok(projection)
    }

    /// Short projection by username. Always read from the store.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Internal`].
    pub async fn get_short_projection_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> Result<UserShortProjection> {
        Ok(self.store.get_projection_by_username(ctx, username).await?)
    }

    /// Short projections of every existing user among `ids`.
    ///
    /// Cache hits are combined with one store query for the misses. Ids that
    /// do not exist are absent from the result; duplicates are collapsed. The
    /// order of the result is unspecified.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Internal`] if the store query for the misses failed.
    pub async fn batch_get_short_projections(
        &self,
        ctx: &OperationContext,
        ids: &[UserId],
    ) -> Result<Vec<UserShortProjection>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let unique: Vec<UserId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        let BatchLookup { mut found, missed } = match self.cache.get_many(&unique).await {
            Ok(lookup) => {
                CacheMetrics::record_hits(lookup.found.len());
                CacheMetrics::record_misses(lookup.missed.len());
                lookup
            }
            Err(error) => {
                // A failed batch call is not trusted for any id
                CacheMetrics::record_error();
                tracing::error!(
                    requested = unique.len(),
                    correlation_id = %ctx.correlation_id(),
                    error = %error,
                    "Projection cache batch lookup failed, reading all from store"
                );
                BatchLookup {
                    found: Vec::new(),
                    missed: unique,
                }
            }
        };

        if missed.is_empty() {
            return Ok(found);
        }

        let fetched = self.store.get_many_projections(ctx, &missed).await?;
        StoreMetrics::record_fallback_read();
        tracing::debug!(
            hits = found.len(),
            misses = missed.len(),
            fetched = fetched.len(),
            correlation_id = %ctx.correlation_id(),
            "Batch projections reconciled"
        );
        for projection in &fetched {
            self.write_back.submit(projection.clone());
        }
        found.extend(fetched);
        Ok(found)
    }
}

fn authorize(ctx: &OperationContext, target: UserId) -> Result<()> {
    match ctx.caller() {
        Some(caller) if caller == target => Ok(()),
        Some(caller) => {
            tracing::debug!(caller = %caller, target = %target, "Caller is not the target user");
            Err(ServiceError::PermissionDenied(
                "users may only access their own record".to_string(),
            ))
        }
        None => Err(ServiceError::PermissionDenied(
            "unauthenticated caller".to_string(),
        )),
    }
}
