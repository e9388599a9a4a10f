//! `PostgreSQL` user store for the user service.
//!
//! This crate implements the `UserStore` trait from `user-service-core` with
//! sqlx. Every create and delete writes its outbox row inside the same
//! transaction as the mutation:
//!
//! - `users`: one row per account, unique `username`
//! - `outbox`: append-only `create` / `delete` markers for downstream publishers
//!
//! # Example
//!
//! ```no_run
//! use user_service_postgres::{PoolSettings, PostgresUserStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresUserStore::connect(
//!     "postgres://localhost/users",
//!     &PoolSettings::default(),
//! ).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod store;

pub use store::{PoolSettings, PostgresUserStore};
