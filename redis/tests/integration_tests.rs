//! Integration tests for `RedisProjectionCache` using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. Run with `cargo test -p user-service-redis -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use user_service_core::cache::{CacheError, ProjectionCache};
use user_service_core::user::{User, UserId};
use user_service_redis::RedisProjectionCache;

async fn setup_cache() -> (ContainerAsync<Redis>, RedisProjectionCache) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");

    let url = format!("redis://127.0.0.1:{port}");
    let mut retries = 0;
    loop {
        if let Ok(cache) = RedisProjectionCache::new(&url, Duration::from_secs(2)).await {
            if cache.ping().await.is_ok() {
                return (container, cache);
            }
        }
        assert!(retries < 30, "Failed to connect to redis");
        retries += 1;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_set_then_get_one() {
    let (_container, cache) = setup_cache().await;
    let projection = User::registered("alice").short_projection();

    assert_eq!(
        cache.get_one(projection.id).await.unwrap_err(),
        CacheError::NotFound
    );
    cache
        .set(projection.id, &projection, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(cache.get_one(projection.id).await.unwrap(), projection);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_get_many_reports_misses() {
    let (_container, cache) = setup_cache().await;
    let a = User::registered("alice").short_projection();
    let b = User::registered("bob").short_projection();
    let missing = UserId::new();
    cache.set(a.id, &a, Duration::from_secs(60)).await.unwrap();
    cache.set(b.id, &b, Duration::from_secs(60)).await.unwrap();

    let lookup = cache.get_many(&[a.id, missing, b.id]).await.unwrap();
    assert_eq!(lookup.found, vec![a, b]);
    assert_eq!(lookup.missed, vec![missing]);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_entries_expire() {
    let (_container, cache) = setup_cache().await;
    let projection = User::registered("alice").short_projection();
    cache
        .set(projection.id, &projection, Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        cache.get_one(projection.id).await.unwrap_err(),
        CacheError::NotFound
    );
}
