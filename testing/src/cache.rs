//! In-memory expiring projection cache.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use user_service_core::cache::{BatchLookup, CacheError, ProjectionCache};
use user_service_core::user::{UserId, UserShortProjection};

#[derive(Debug, Default)]
struct Counters {
    get_one: AtomicUsize,
    get_many: AtomicUsize,
    set: AtomicUsize,
}

#[derive(Debug, Default)]
struct Faults {
    get_one: AtomicBool,
    get_many: AtomicBool,
    set: AtomicBool,
}

/// In-memory [`ProjectionCache`] with per-entry expiry.
///
/// Expiry reads `tokio::time::Instant`, so tests running with a paused clock
/// can advance past a TTL deterministically.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionCache {
    entries: Arc<RwLock<HashMap<UserId, (UserShortProjection, Instant)>>>,
    counters: Arc<Counters>,
    faults: Arc<Faults>,
    set_notify: Arc<Notify>,
}

impl InMemoryProjectionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `projection` directly for `ttl`, bypassing counters.
    pub fn seed(&self, projection: UserShortProjection, ttl: Duration) {
        self.entries
            .write()
            .unwrap()
            .insert(projection.id, (projection, Instant::now() + ttl));
    }

    /// Live entry for `id`, without counting a call.
    #[must_use]
    pub fn peek(&self, id: UserId) -> Option<UserShortProjection> {
        self.live(id)
    }

    /// Calls to [`ProjectionCache::get_one`].
    #[must_use]
    pub fn get_one_calls(&self) -> usize {
        self.counters.get_one.load(Ordering::SeqCst)
    }

    /// Calls to [`ProjectionCache::get_many`].
    #[must_use]
    pub fn get_many_calls(&self) -> usize {
        self.counters.get_many.load(Ordering::SeqCst)
    }

    /// Calls to [`ProjectionCache::set`], including failed ones.
    #[must_use]
    pub fn set_calls(&self) -> usize {
        self.counters.set.load(Ordering::SeqCst)
    }

    /// Calls of any kind.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.get_one_calls() + self.get_many_calls() + self.set_calls()
    }

    /// Make `get_one` fail with [`CacheError::Internal`].
    pub fn fail_get_one(&self, fail: bool) {
        self.faults.get_one.store(fail, Ordering::SeqCst);
    }

    /// Make `get_many` fail with [`CacheError::Internal`].
    pub fn fail_get_many(&self, fail: bool) {
        self.faults.get_many.store(fail, Ordering::SeqCst);
    }

    /// Make `set` fail with [`CacheError::Internal`].
    pub fn fail_set(&self, fail: bool) {
        self.faults.set.store(fail, Ordering::SeqCst);
    }

    /// Wait until at least `count` `set` calls were made, or `timeout` passes.
    ///
    /// Returns `true` if the count was reached.
    pub async fn wait_for_sets(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.set_notify.notified();
                if self.set_calls() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn live(&self, id: UserId) -> Option<UserShortProjection> {
        self.entries
            .read()
            .unwrap()
            .get(&id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(projection, _)| projection.clone())
    }
}

impl ProjectionCache for InMemoryProjectionCache {
    async fn get_one(&self, id: UserId) -> Result<UserShortProjection, CacheError> {
        self.counters.get_one.fetch_add(1, Ordering::SeqCst);
        if self.faults.get_one.load(Ordering::SeqCst) {
            return Err(CacheError::Internal("injected get failure".to_string()));
        }
        self.live(id).ok_or(CacheError::NotFound)
    }

    async fn get_many(&self, ids: &[UserId]) -> Result<BatchLookup, CacheError> {
        self.counters.get_many.fetch_add(1, Ordering::SeqCst);
        if self.faults.get_many.load(Ordering::SeqCst) {
            return Err(CacheError::Internal("injected batch failure".to_string()));
        }
        let mut lookup = BatchLookup::default();
        for id in ids {
            match self.live(*id) {
                Some(projection) => lookup.found.push(projection),
                None => lookup.missed.push(*id),
            }
        }
        Ok(lookup)
    }

    async fn set(
        &self,
        id: UserId,
        projection: &UserShortProjection,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.counters.set.fetch_add(1, Ordering::SeqCst);
        let result = if self.faults.set.load(Ordering::SeqCst) {
            Err(CacheError::Internal("injected set failure".to_string()))
        } else {
            self.entries
                .write()
                .unwrap()
                .insert(id, (projection.clone(), Instant::now() + ttl));
            Ok(())
        };
        self.set_notify.notify_waiters();
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use user_service_core::user::User;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryProjectionCache::new();
        let projection = User::registered("alice").short_projection();
        let id = projection.id;

        cache.set(id, &projection, Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get_one(id).await.unwrap(), projection);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get_one(id).await.unwrap_err(), CacheError::NotFound);
    }

    #[tokio::test]
    async fn batch_lookup_splits_hits_and_misses() {
        let cache = InMemoryProjectionCache::new();
        let hit = User::registered("alice").short_projection();
        let miss = UserId::new();
        cache.seed(hit.clone(), Duration::from_secs(60));

        let lookup = cache.get_many(&[hit.id, miss]).await.unwrap();
        assert_eq!(lookup.found, vec![hit]);
        assert_eq!(lookup.missed, vec![miss]);
        assert_eq!(cache.get_many_calls(), 1);
    }

    #[tokio::test]
    async fn failing_set_still_counts() {
        let cache = InMemoryProjectionCache::new();
        let projection = User::registered("alice").short_projection();
        cache.fail_set(true);

        assert!(cache.set(projection.id, &projection, Duration::from_secs(1)).await.is_err());
        assert!(cache.wait_for_sets(1, Duration::from_millis(10)).await);
        assert!(cache.peek(projection.id).is_none());
    }
}
