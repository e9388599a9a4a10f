//! # User Service
//!
//! The user-record service: it owns the canonical user accounts, keeps them in
//! sync with the upstream identity system and serves them to other services.
//!
//! ## Modules
//!
//! - [`sync`]: lifecycle event consumer loop and idempotent change handlers
//! - [`service`]: user operations and the cache-aside projection read path
//! - [`write_back`]: bounded background cache repopulation
//! - [`api`]: axum router of the HTTP surface
//! - [`config`]: environment configuration
//! - [`app`]: process wiring, supervision and graceful shutdown

#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod config;
pub mod service;
pub mod sync;
pub mod write_back;

pub use config::{Config, ConfigError};
pub use service::{ServiceSettings, UserService};
