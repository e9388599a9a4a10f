//! In-memory user store with a transactional outbox.
//!
//! Mutations apply to the `users` map and the outbox under one write lock, so
//! an injected outbox failure leaves both untouched (the in-memory analogue of
//! a rolled-back transaction).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use user_service_core::context::OperationContext;
use user_service_core::outbox::PendingChange;
use user_service_core::store::{StoreError, UserStore};
use user_service_core::user::{User, UserId, UserShortProjection};

/// Store operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`UserStore::create`]
    Create,
    /// [`UserStore::delete_by_username`]
    Delete,
    /// [`UserStore::get_one`]
    GetOne,
    /// [`UserStore::get_one_projection`]
    GetOneProjection,
    /// [`UserStore::get_projection_by_username`]
    GetProjectionByUsername,
    /// [`UserStore::get_many_projections`]
    GetManyProjections,
    /// [`UserStore::update`]
    Update,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    error: StoreError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    outbox: Vec<PendingChange>,
}

impl Tables {
    fn id_by_username(&self, username: &str) -> Option<UserId> {
        self.users
            .values()
            .find(|user| user.username == username)
            .map(|user| user.id)
    }
}

#[derive(Debug, Default)]
struct Probes {
    calls: HashMap<StoreOp, AtomicUsize>,
    failures: Mutex<HashMap<StoreOp, InjectedFailure>>,
    outbox_failure: Mutex<bool>,
    batch_requests: Mutex<Vec<Vec<UserId>>>,
}

/// In-memory [`UserStore`] for fast, deterministic tests.
///
/// Clones share state, so a test can keep a handle for assertions while the
/// code under test owns another.
///
/// # Example
///
/// ```
/// use user_service_testing::{InMemoryUserStore, StoreOp};
/// use user_service_core::store::UserStore;
/// use user_service_core::context::OperationContext;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryUserStore::new();
/// let id = store.create_by_username(&OperationContext::new(), "alice").await?;
///
/// assert_eq!(store.calls(StoreOp::Create), 1);
/// assert_eq!(store.outbox().len(), 1);
/// assert!(store.user(id).is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryUserStore {
    tables: Arc<RwLock<Tables>>,
    probes: Arc<Probes>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let probes = Probes {
            calls: [
                StoreOp::Create,
                StoreOp::Delete,
                StoreOp::GetOne,
                StoreOp::GetOneProjection,
                StoreOp::GetProjectionByUsername,
                StoreOp::GetManyProjections,
                StoreOp::Update,
            ]
            .into_iter()
            .map(|op| (op, AtomicUsize::new(0)))
            .collect(),
            ..Probes::default()
        };
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            probes: Arc::new(probes),
        }
    }

    /// Insert `user` directly, bypassing counters and the outbox.
    pub fn seed(&self, user: User) {
        self.tables.write().unwrap().users.insert(user.id, user);
    }

    /// Number of calls made to `op`, including failed ones.
    #[must_use]
    pub fn calls(&self, op: StoreOp) -> usize {
        self.probes
            .calls
            .get(&op)
            .map_or(0, |count| count.load(Ordering::SeqCst))
    }

    /// Sum of all calls to any operation.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.probes
            .calls
            .values()
            .map(|count| count.load(Ordering::SeqCst))
            .sum()
    }

    /// Id lists passed to [`UserStore::get_many_projections`], in call order.
    #[must_use]
    pub fn batch_requests(&self) -> Vec<Vec<UserId>> {
        self.probes.batch_requests.lock().unwrap().clone()
    }

    /// Make `op` fail with `error` on every call.
    pub fn fail_always(&self, op: StoreOp, error: StoreError) {
        self.inject(op, error, None);
    }

    /// Make the next `times` calls to `op` fail with `error`.
    pub fn fail_times(&self, op: StoreOp, error: StoreError, times: usize) {
        self.inject(op, error, Some(times));
    }

    /// Make the outbox insert of every create/delete fail, rolling the mutation back.
    pub fn fail_outbox_writes(&self, fail: bool) {
        *self.probes.outbox_failure.lock().unwrap() = fail;
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.probes.failures.lock().unwrap().clear();
        self.fail_outbox_writes(false);
    }

    /// Snapshot of the outbox in insertion order.
    #[must_use]
    pub fn outbox(&self) -> Vec<PendingChange> {
        self.tables.read().unwrap().outbox.clone()
    }

    /// Stored user with `id`.
    #[must_use]
    pub fn user(&self, id: UserId) -> Option<User> {
        self.tables.read().unwrap().users.get(&id).cloned()
    }

    /// Stored users named `username`; at most one by construction.
    #[must_use]
    pub fn users_named(&self, username: &str) -> Vec<User> {
        self.tables
            .read()
            .unwrap()
            .users
            .values()
            .filter(|user| user.username == username)
            .cloned()
            .collect()
    }

    /// Number of stored users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().unwrap().users.len()
    }

    /// `true` if no users are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn inject(&self, op: StoreOp, error: StoreError, remaining: Option<usize>) {
        self.probes
            .failures
            .lock()
            .unwrap()
            .insert(op, InjectedFailure { error, remaining });
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        if let Some(count) = self.probes.calls.get(&op) {
            count.fetch_add(1, Ordering::SeqCst);
        }

        let mut failures = self.probes.failures.lock().unwrap();
        let Some(failure) = failures.get_mut(&op) else {
            return Ok(());
        };
        let error = failure.error.clone();
        let (fails, spent) = match failure.remaining.as_mut() {
            None => (true, false),
            Some(0) => (false, true),
            Some(n) => {
                *n -= 1;
                (true, *n == 0)
            }
        };
        if spent {
            failures.remove(&op);
        }
        if fails { Err(error) } else { Ok(()) }
    }

    fn outbox_fails(&self) -> bool {
        *self.probes.outbox_failure.lock().unwrap()
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for InMemoryUserStore {
    async fn create(&self, ctx: &OperationContext, user: &User) -> Result<UserId, StoreError> {
        self.enter(StoreOp::Create)?;
        ctx.within_deadline(async {
            let mut tables = self.tables.write().unwrap();
            if tables.users.contains_key(&user.id) || tables.id_by_username(&user.username).is_some()
            {
                return Err(StoreError::AlreadyExists);
            }
            if self.outbox_fails() {
                return Err(StoreError::Internal("outbox insert failed".to_string()));
            }
            tables.users.insert(user.id, user.clone());
            tables.outbox.push(PendingChange::create(user.id));
            Ok(user.id)
        })
        .await?
    }

    async fn delete_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> Result<UserId, StoreError> {
        self.enter(StoreOp::Delete)?;
        ctx.within_deadline(async {
            let mut tables = self.tables.write().unwrap();
            let id = tables.id_by_username(username).ok_or(StoreError::NotFound)?;
            if self.outbox_fails() {
                return Err(StoreError::Internal("outbox insert failed".to_string()));
            }
            tables.users.remove(&id);
            tables.outbox.push(PendingChange::delete(id));
            Ok(id)
        })
        .await?
    }

    async fn get_one(&self, ctx: &OperationContext, id: UserId) -> Result<User, StoreError> {
        self.enter(StoreOp::GetOne)?;
        ctx.within_deadline(async {
            self.tables
                .read()
                .unwrap()
                .users
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_one_projection(
        &self,
        ctx: &OperationContext,
        id: UserId,
    ) -> Result<UserShortProjection, StoreError> {
        self.enter(StoreOp::GetOneProjection)?;
        ctx.within_deadline(async {
            self.tables
                .read()
                .unwrap()
                .users
                .get(&id)
                .map(User::short_projection)
                .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_projection_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> Result<UserShortProjection, StoreError> {
        self.enter(StoreOp::GetProjectionByUsername)?;
        ctx.within_deadline(async {
            self.tables
                .read()
                .unwrap()
                .users
                .values()
                .find(|user| user.username == username)
                .map(User::short_projection)
                .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_many_projections(
        &self,
        ctx: &OperationContext,
        ids: &[UserId],
    ) -> Result<Vec<UserShortProjection>, StoreError> {
        self.probes.batch_requests.lock().unwrap().push(ids.to_vec());
        self.enter(StoreOp::GetManyProjections)?;
        ctx.within_deadline(async {
            let tables = self.tables.read().unwrap();
            Ok(ids
                .iter()
                .filter_map(|id| tables.users.get(id))
                .map(User::short_projection)
                .collect())
        })
        .await?
    }

    async fn update(&self, ctx: &OperationContext, user: &User) -> Result<(), StoreError> {
        self.enter(StoreOp::Update)?;
        ctx.within_deadline(async {
            let mut tables = self.tables.write().unwrap();
            let stored = tables.users.get_mut(&user.id).ok_or(StoreError::NotFound)?;
            stored.display_name.clone_from(&user.display_name);
            stored.image_url.clone_from(&user.image_url);
            stored.status_text.clone_from(&user.status_text);
            stored.updated_at = Utc::now();
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use user_service_core::outbox::OutboxChangeType;

    #[tokio::test]
    async fn create_and_delete_write_outbox_rows() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();

        let id = store.create_by_username(&ctx, "alice").await.unwrap();
        let deleted = store.delete_by_username(&ctx, "alice").await.unwrap();

        assert_eq!(id, deleted);
        let outbox = store.outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].change_type, OutboxChangeType::Create);
        assert_eq!(outbox[1].change_type, OutboxChangeType::Delete);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        store.create_by_username(&ctx, "alice").await.unwrap();

        let err = store.create_by_username(&ctx, "alice").await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists);
        assert_eq!(store.outbox().len(), 1);
    }

    #[tokio::test]
    async fn outbox_failure_rolls_back_the_mutation() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        store.fail_outbox_writes(true);

        assert!(store.create_by_username(&ctx, "alice").await.is_err());
        assert!(store.is_empty());
        assert!(store.outbox().is_empty());
    }

    #[tokio::test]
    async fn outbox_failure_on_delete_keeps_the_user() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        let id = store.create_by_username(&ctx, "alice").await.unwrap();
        store.fail_outbox_writes(true);

        assert!(store.delete_by_username(&ctx, "alice").await.is_err());

        assert_eq!(store.user(id).map(|user| user.username), Some("alice".to_string()));
        let outbox = store.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].change_type, OutboxChangeType::Create);
    }

    #[tokio::test]
    async fn failed_update_keeps_the_old_record() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        let id = store.create_by_username(&ctx, "alice").await.unwrap();
        let before = store.user(id).unwrap();
        store.fail_always(StoreOp::Update, StoreError::Internal("serialization failure".to_string()));

        let mut changed = before.clone();
        changed.display_name = "Alice".to_string();
        assert!(store.update(&ctx, &changed).await.is_err());

        assert_eq!(store.user(id), Some(before));
        assert_eq!(store.outbox().len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        store.fail_times(StoreOp::Create, StoreError::Internal("down".to_string()), 2);

        assert!(store.create_by_username(&ctx, "a1a").await.is_err());
        assert!(store.create_by_username(&ctx, "a1a").await.is_err());
        assert!(store.create_by_username(&ctx, "a1a").await.is_ok());
        assert_eq!(store.calls(StoreOp::Create), 3);
    }

    #[tokio::test]
    async fn update_touches_only_mutable_fields() {
        let store = InMemoryUserStore::new();
        let ctx = OperationContext::new();
        let id = store.create_by_username(&ctx, "alice").await.unwrap();

        let mut changed = store.user(id).unwrap();
        changed.display_name = "Alice".to_string();
        changed.username = "mallory".to_string();
        store.update(&ctx, &changed).await.unwrap();

        let stored = store.user(id).unwrap();
        assert_eq!(stored.display_name, "Alice");
        assert_eq!(stored.username, "alice");
        assert!(store.outbox().len() == 1, "update writes no outbox row");
    }
}
