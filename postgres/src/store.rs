//! `PostgreSQL` implementation of [`UserStore`].

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use user_service_core::context::OperationContext;
use user_service_core::outbox::PendingChange;
use user_service_core::store::{StoreError, UserStore};
use user_service_core::user::{User, UserId, UserShortProjection};
use uuid::Uuid;

/// Connection pool sizing.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound of open connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    display_name: String,
    image_url: Option<String>,
    status_text: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId::from_uuid(row.id),
            username: row.username,
            display_name: row.display_name,
            image_url: row.image_url,
            status_text: row.status_text,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ProjectionRow {
    id: Uuid,
    username: String,
    display_name: String,
    image_url: Option<String>,
    status_text: Option<String>,
}

impl From<ProjectionRow> for UserShortProjection {
    fn from(row: ProjectionRow) -> Self {
        Self {
            id: UserId::from_uuid(row.id),
            username: row.username,
            display_name: row.display_name,
            image_url: row.image_url,
            status_text: row.status_text,
        }
    }
}

const PROJECTION_COLUMNS: &str = "id, username, display_name, image_url, status_text";

fn internal(action: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Internal(format!("Failed to {action}: {e}"))
}

/// `PostgreSQL` user store.
///
/// Cloning shares the underlying pool.
#[derive(Clone, Debug)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Internal`] if the database is unreachable.
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(internal("connect to database"))?;
        tracing::info!(
            max_connections = settings.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Underlying pool, for health checks.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check that a connection can run a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Internal`] if the database does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(internal("ping database"))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(internal("begin transaction"))
    }
}

async fn insert_outbox(
    tx: &mut Transaction<'static, Postgres>,
    change: PendingChange,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO outbox (change_type, user_id) VALUES ($1, $2)")
        .bind(change.change_type.as_str())
        .bind(*change.user_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(internal("write outbox row"))?;
    Ok(())
}

impl UserStore for PostgresUserStore {
    async fn create(&self, ctx: &OperationContext, user: &User) -> Result<UserId, StoreError> {
        ctx.within_deadline(async {
            let mut tx = self.begin().await?;

            sqlx::query(
                r"
                INSERT INTO users (id, username, display_name, image_url, status_text, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(*user.id.as_uuid())
            .bind(&user.username)
            .bind(&user.display_name)
            .bind(user.image_url.as_deref())
            .bind(user.status_text.as_deref())
            .bind(user.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return StoreError::AlreadyExists;
                    }
                }
                StoreError::Internal(format!("Failed to create user: {e}"))
            })?;

            insert_outbox(&mut tx, PendingChange::create(user.id)).await?;
            tx.commit().await.map_err(internal("commit user creation"))?;

            tracing::debug!(
                user_id = %user.id,
                username = %user.username,
                correlation_id = %ctx.correlation_id(),
                "User created"
            );
            Ok(user.id)
        })
        .await?
    }

    async fn delete_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> Result<UserId, StoreError> {
        ctx.within_deadline(async {
            let mut tx = self.begin().await?;

            let id: Uuid = sqlx::query_scalar("DELETE FROM users WHERE username = $1 RETURNING id")
                .bind(username)
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("delete user"))?
                .ok_or(StoreError::NotFound)?;
            let id = UserId::from_uuid(id);

            insert_outbox(&mut tx, PendingChange::delete(id)).await?;
            tx.commit().await.map_err(internal("commit user deletion"))?;

            tracing::debug!(
                user_id = %id,
                username,
                correlation_id = %ctx.correlation_id(),
                "User deleted"
            );
            Ok(id)
        })
        .await?
    }

    async fn get_one(&self, ctx: &OperationContext, id: UserId) -> Result<User, StoreError> {
        ctx.within_deadline(async {
            sqlx::query_as::<_, UserRow>(
                r"
                SELECT id, username, display_name, image_url, status_text, updated_at
                FROM users
                WHERE id = $1
                ",
            )
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal("get user"))?
            .map(User::from)
            .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_one_projection(
        &self,
        ctx: &OperationContext,
        id: UserId,
    ) -> Result<UserShortProjection, StoreError> {
        ctx.within_deadline(async {
            sqlx::query_as::<_, ProjectionRow>(&format!(
                "SELECT {PROJECTION_COLUMNS} FROM users WHERE id = $1"
            ))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal("get user projection"))?
            .map(UserShortProjection::from)
            .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_projection_by_username(
        &self,
        ctx: &OperationContext,
        username: &str,
    ) -> Result<UserShortProjection, StoreError> {
        ctx.within_deadline(async {
            sqlx::query_as::<_, ProjectionRow>(&format!(
                "SELECT {PROJECTION_COLUMNS} FROM users WHERE username = $1"
            ))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal("get user projection by username"))?
            .map(UserShortProjection::from)
            .ok_or(StoreError::NotFound)
        })
        .await?
    }

    async fn get_many_projections(
        &self,
        ctx: &OperationContext,
        ids: &[UserId],
    ) -> Result<Vec<UserShortProjection>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();

        ctx.within_deadline(async {
            let rows = sqlx::query_as::<_, ProjectionRow>(&format!(
                "SELECT {PROJECTION_COLUMNS} FROM users WHERE id = ANY($1)"
            ))
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(internal("get user projections"))?;
            Ok(rows.into_iter().map(UserShortProjection::from).collect())
        })
        .await?
    }

    async fn update(&self, ctx: &OperationContext, user: &User) -> Result<(), StoreError> {
        ctx.within_deadline(async {
            let result = sqlx::query(
                r"
                UPDATE users
                SET display_name = $2,
                    image_url = $3,
                    status_text = $4,
                    updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(*user.id.as_uuid())
            .bind(&user.display_name)
            .bind(user.image_url.as_deref())
            .bind(user.status_text.as_deref())
            .execute(&self.pool)
            .await
            .map_err(internal("update user"))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await?
    }
}
