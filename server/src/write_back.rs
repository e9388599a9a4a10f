//! Background cache repopulation.
//!
//! Projections read from the store are repaired into the cache by a worker
//! task fed through a bounded queue. Submitting never waits: a full queue drops
//! the entry, since the next miss will schedule it again.
//!
//! The worker takes up to [`WRITE_BATCH`] queued entries at a time and writes
//! them concurrently, so a slow cache holds the queue for one call timeout per
//! batch rather than per entry.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use user_service_core::cache::ProjectionCache;
use user_service_core::user::UserShortProjection;
use user_service_runtime::metrics::CacheMetrics;

/// Entries written concurrently per drain step.
pub const WRITE_BATCH: usize = 32;

/// Sending half of the write-back queue.
#[derive(Clone, Debug)]
pub struct WriteBack {
    queue: mpsc::Sender<UserShortProjection>,
}

impl WriteBack {
    /// Start the worker that writes queued projections into `cache` for `ttl`.
    ///
    /// The worker exits once every [`WriteBack`] clone has been dropped and the
    /// queue is drained. Must be called inside a tokio runtime.
    pub fn spawn<C: ProjectionCache>(
        cache: Arc<C>,
        ttl: Duration,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(drain(cache, ttl, receiver));
        (Self { queue }, worker)
    }

    /// Schedule `projection` for a cache write. Returns immediately.
    pub fn submit(&self, projection: UserShortProjection) {
        match self.queue.try_send(projection) {
            Ok(()) => {}
            Err(TrySendError::Full(projection)) => {
                CacheMetrics::record_write_back_dropped();
                tracing::debug!(user_id = %projection.id, "Write-back queue full, dropping entry");
            }
            Err(TrySendError::Closed(projection)) => {
                CacheMetrics::record_write_back_dropped();
                tracing::warn!(user_id = %projection.id, "Write-back worker stopped, dropping entry");
            }
        }
    }
}

async fn drain<C: ProjectionCache>(
    cache: Arc<C>,
    ttl: Duration,
    mut receiver: mpsc::Receiver<UserShortProjection>,
) {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    while receiver.recv_many(&mut batch, WRITE_BATCH).await > 0 {
        join_all(batch.drain(..).map(|projection| write(&*cache, projection, ttl))).await;
    }
    tracing::debug!("Write-back worker stopped");
}

async fn write<C: ProjectionCache>(cache: &C, projection: UserShortProjection, ttl: Duration) {
    if let Err(error) = cache.set(projection.id, &projection, ttl).await {
        CacheMetrics::record_write_back_failure();
        tracing::warn!(user_id = %projection.id, error = %error, "Cache write-back failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use user_service_core::cache::{BatchLookup, CacheError};
    use user_service_core::user::{User, UserId};
    use user_service_testing::InMemoryProjectionCache;

    /// Cache whose writes each take `delay`.
    struct SlowCache {
        inner: Arc<InMemoryProjectionCache>,
        delay: Duration,
    }

    impl ProjectionCache for SlowCache {
        async fn get_one(&self, id: UserId) -> Result<UserShortProjection, CacheError> {
            self.inner.get_one(id).await
        }

        async fn get_many(&self, ids: &[UserId]) -> Result<BatchLookup, CacheError> {
            self.inner.get_many(ids).await
        }

        async fn set(
            &self,
            id: UserId,
            projection: &UserShortProjection,
            ttl: Duration,
        ) -> Result<(), CacheError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(id, projection, ttl).await
        }
    }

    #[tokio::test]
    async fn submitted_projections_reach_the_cache() {
        let cache = Arc::new(InMemoryProjectionCache::new());
        let (write_back, _worker) = WriteBack::spawn(Arc::clone(&cache), Duration::from_secs(60), 8);
        let projection = User::registered("alice").short_projection();

        write_back.submit(projection.clone());

        assert!(cache.wait_for_sets(1, Duration::from_secs(1)).await);
        assert_eq!(cache.peek(projection.id), Some(projection));
    }

    #[tokio::test]
    async fn failed_writes_do_not_stop_the_worker() {
        let cache = Arc::new(InMemoryProjectionCache::new());
        cache.fail_set(true);
        let (write_back, _worker) = WriteBack::spawn(Arc::clone(&cache), Duration::from_secs(60), 8);

        write_back.submit(User::registered("alice").short_projection());
        assert!(cache.wait_for_sets(1, Duration::from_secs(1)).await);

        cache.fail_set(false);
        let bob = User::registered("bob").short_projection();
        write_back.submit(bob.clone());
        assert!(cache.wait_for_sets(2, Duration::from_secs(1)).await);
        assert_eq!(cache.peek(bob.id), Some(bob));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_writes_are_issued_concurrently() {
        let inner = Arc::new(InMemoryProjectionCache::new());
        let cache = Arc::new(SlowCache {
            inner: Arc::clone(&inner),
            delay: Duration::from_millis(500),
        });
        let (write_back, _worker) = WriteBack::spawn(cache, Duration::from_secs(60), 16);

        for i in 0..8 {
            write_back.submit(User::registered(format!("user{i}")).short_projection());
        }

        // One by one this would take four seconds
        assert!(inner.wait_for_sets(8, Duration::from_millis(1500)).await);
    }

    #[tokio::test]
    async fn worker_exits_when_senders_are_dropped() {
        let cache = Arc::new(InMemoryProjectionCache::new());
        let (write_back, worker) = WriteBack::spawn(cache, Duration::from_secs(60), 1);
        drop(write_back);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should exit")
            .expect("worker should not panic");
    }
}
