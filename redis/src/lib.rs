//! Redis-based projection cache for the user service.
//!
//! # Architecture
//!
//! Projections are stored in Redis with:
//! - **Key**: `user:short:{user_id}` → bincode-serialized `UserShortProjection`
//! - **TTL**: set on every write (`SET .. EX`)
//! - **Batch reads**: one `MGET` per request; undecodable entries count as misses
//!
//! Every command runs under a per-call timeout so a stalled Redis cannot hold
//! up the read path (which always has a store fallback).
//!
//! # Example
//!
//! ```no_run
//! use user_service_redis::RedisProjectionCache;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisProjectionCache::new("redis://127.0.0.1:6379", Duration::from_millis(500)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::time::Duration;
use user_service_core::cache::{BatchLookup, CacheError, ProjectionCache};
use user_service_core::user::{UserId, UserShortProjection};

/// Redis projection cache.
///
/// Provides:
/// - Expiring projection storage
/// - Single-round-trip batch lookups
/// - Connection pooling via `ConnectionManager`
#[derive(Clone)]
pub struct RedisProjectionCache {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    /// Upper bound for a single command.
    operation_timeout: Duration,
}

impl RedisProjectionCache {
    /// Create a new Redis projection cache.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `operation_timeout` - Upper bound for each command
    ///
    /// # Errors
    ///
    /// Returns error if connection to Redis fails.
    pub async fn new(redis_url: &str, operation_timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Internal(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Internal(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            conn_manager,
            operation_timeout,
        })
    }

    /// Get the Redis key for a projection.
    fn projection_key(id: UserId) -> String {
        format!("user:short:{id}")
    }

    /// Check that Redis answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Internal`] on failure or timeout.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _pong: String = self
            .bounded("ping", async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn bounded<T, F>(&self, action: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Internal(format!("Failed to {action}: {e}"))),
            Err(_) => Err(CacheError::Internal(format!(
                "Failed to {action}: timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }
}

/// Pair an `MGET` reply with the requested ids.
///
/// Ids the reply has no slot for count as missed.
fn match_reply(ids: &[UserId], values: Vec<Option<Vec<u8>>>) -> BatchLookup {
    if values.len() != ids.len() {
        tracing::warn!(
            requested = ids.len(),
            returned = values.len(),
            "MGET reply length does not match the request"
        );
    }

    let mut values = values.into_iter();
    let mut lookup = BatchLookup::default();
    for &id in ids {
        match values.next().flatten().map(|bytes| decode(&bytes)) {
            Some(Ok(projection)) => lookup.found.push(projection),
            Some(Err(e)) => {
                tracing::warn!(user_id = %id, error = %e, "Discarding undecodable cache entry");
                lookup.missed.push(id);
            }
            None => lookup.missed.push(id),
        }
    }
    lookup
}

fn decode(bytes: &[u8]) -> Result<UserShortProjection, CacheError> {
    bincode::deserialize(bytes).map_err(|e| CacheError::Internal(format!("Failed to decode projection: {e}")))
}

impl ProjectionCache for RedisProjectionCache {
    async fn get_one(&self, id: UserId) -> Result<UserShortProjection, CacheError> {
        let mut conn = self.conn_manager.clone();
        let key = Self::projection_key(id);

        let bytes: Option<Vec<u8>> = self
            .bounded("get projection", async move { conn.get(&key).await })
            .await?;

        match bytes {
            Some(bytes) => decode(&bytes),
            None => Err(CacheError::NotFound),
        }
    }

    async fn get_many(&self, ids: &[UserId]) -> Result<BatchLookup, CacheError> {
        if ids.is_empty() {
            return Ok(BatchLookup::default());
        }

        let mut conn = self.conn_manager.clone();
        let keys: Vec<String> = ids.iter().copied().map(Self::projection_key).collect();

        // Explicit MGET: a single-key `get` would not return an array.
        let values: Vec<Option<Vec<u8>>> = self
            .bounded("get projections", async move {
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await
            })
            .await?;

        Ok(match_reply(ids, values))
    }

    async fn set(
        &self,
        id: UserId,
        projection: &UserShortProjection,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = bincode::serialize(projection)
            .map_err(|e| CacheError::Internal(format!("Failed to encode projection: {e}")))?;
        let ttl_seconds = ttl.as_secs().max(1);
        let mut conn = self.conn_manager.clone();
        let key = Self::projection_key(id);

        self.bounded("set projection", async move {
            conn.set_ex::<_, _, ()>(&key, bytes, ttl_seconds).await
        })
        .await?;

        tracing::trace!(user_id = %id, ttl_seconds, "Cached projection");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_id() {
        let id = UserId::new();
        assert_eq!(RedisProjectionCache::projection_key(id), format!("user:short:{id}"));
    }

    #[test]
    fn short_reply_leaves_the_rest_missed() {
        let alice = user_service_core::user::User::registered("alice").short_projection();
        let ids = [alice.id, UserId::new(), UserId::new()];
        let reply = vec![Some(bincode::serialize(&alice).unwrap())];

        let lookup = match_reply(&ids, reply);

        assert_eq!(lookup.found, vec![alice]);
        assert_eq!(lookup.missed, ids[1..].to_vec());
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(matches!(decode(b"\x01"), Err(CacheError::Internal(_))));
    }
}
