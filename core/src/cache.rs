//! Projection cache contract.
//!
//! The cache is a plain expiring remote map of [`UserShortProjection`]s keyed
//! by [`UserId`]. It is never the source of truth: any entry may be evicted or
//! stale, and every failure has a store fallback on the read path.

use crate::user::{UserId, UserShortProjection};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Tagged outcome of a failed cache call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is absent or expired.
    #[error("cache miss")]
    NotFound,

    /// Transport, timeout or decoding failure.
    #[error("cache error: {0}")]
    Internal(String),
}

/// Result of a batch lookup: what was found and what was not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLookup {
    /// Projections present in the cache.
    pub found: Vec<UserShortProjection>,
    /// Requested ids that were not present.
    pub missed: Vec<UserId>,
}

/// Expiring projection cache.
pub trait ProjectionCache: Send + Sync + 'static {
    /// Look up one projection.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] on a miss, [`CacheError::Internal`] otherwise.
    fn get_one(
        &self,
        id: UserId,
    ) -> impl Future<Output = Result<UserShortProjection, CacheError>> + Send;

    /// Look up many projections in one round trip.
    ///
    /// Every requested id appears in exactly one of `found` or `missed`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Internal`] if the batch call itself failed.
    fn get_many(
        &self,
        ids: &[UserId],
    ) -> impl Future<Output = Result<BatchLookup, CacheError>> + Send;

    /// Store a projection for `ttl`.
    ///
    /// # Errors
    ///
    /// [`CacheError::Internal`] on failure.
    fn set(
        &self,
        id: UserId,
        projection: &UserShortProjection,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}
