//! Process wiring and lifecycle.
//!
//! 1. **Startup**: connect store, cache and broker under one initialization
//!    deadline, then bind the HTTP and metrics listeners
//! 2. **Runtime**: the sync consumer, HTTP server and metrics server run as
//!    supervised tasks sharing one cancellation token
//! 3. **Shutdown**: SIGINT/SIGTERM or the first task failure cancels the
//!    token; the HTTP server drains for a bounded grace period and the process
//!    waits for every task before reporting

use crate::api::health::Readiness;
use crate::api::{self, ApiState};
use crate::config::Config;
use crate::service::{ServiceSettings, UserService};
use crate::sync::{ChangeHandlers, HandlerSettings, SyncConsumer};
use anyhow::{Context, anyhow};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use user_service_core::OperationContext;
use user_service_postgres::{PoolSettings, PostgresUserStore};
use user_service_redis::RedisProjectionCache;
use user_service_redpanda::RedpandaLogConsumer;
use user_service_runtime::Supervisor;
use user_service_runtime::metrics::MetricsServer;

/// How long the write-back worker may flush after shutdown.
const WRITE_BACK_FLUSH: Duration = Duration::from_secs(1);

type Consumer = SyncConsumer<RedpandaLogConsumer, PostgresUserStore>;

/// Connected collaborators.
struct Resources {
    store: Arc<PostgresUserStore>,
    cache: Arc<RedisProjectionCache>,
    consumer: Consumer,
}

/// Run the service until shutdown.
///
/// # Errors
///
/// Returns an error if initialization fails or any supervised task failed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut metrics = MetricsServer::new(config.metrics.addr());
    metrics.start().context("Failed to install metrics recorder")?;

    let init = OperationContext::new().with_timeout(config.init_timeout);
    let resources = init
        .within_deadline(connect(&config, &init))
        .await
        .map_err(|_| anyhow!("initialization did not finish within {:?}", config.init_timeout))??;

    let (service, write_back) = UserService::new(
        resources.store,
        resources.cache,
        ServiceSettings {
            cache_ttl: config.cache.ttl,
            write_back_capacity: config.cache.write_back_capacity,
        },
    );

    let http_listener = TcpListener::bind(config.http.addr())
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", config.http.addr()))?;
    let metrics_listener = TcpListener::bind(metrics.addr())
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", metrics.addr()))?;

    let readiness = Readiness::new();
    let http_router = api::router(ApiState {
        service,
        readiness: readiness.clone(),
    });

    let mut supervisor = Supervisor::new(CancellationToken::new());
    let consumer = resources.consumer;
    supervisor.spawn("sync-consumer", move |cancel| async move {
        consumer.run(cancel).await.map_err(anyhow::Error::from)
    });

    let grace = config.http.shutdown_grace;
    let http_addr = config.http.addr();
    let http_readiness = readiness.clone();
    supervisor.spawn("http", move |cancel| async move {
        info!(addr = %http_addr, "HTTP server listening");
        let result = serve(http_listener, http_router, cancel, grace).await;
        http_readiness.set(false);
        result
    });

    let metrics_addr = metrics.addr();
    match metrics.handle().cloned() {
        Some(handle) => {
            supervisor.spawn("metrics", move |cancel| async move {
                info!(addr = %metrics_addr, "Metrics server listening");
                serve(metrics_listener, api::metrics_router(handle), cancel, grace).await
            });
        }
        None => warn!("Metrics recorder owned elsewhere, /metrics not served"),
    }

    supervisor.spawn("signals", |cancel| async move {
        tokio::select! {
            result = shutdown_signal() => {
                result?;
                cancel.cancel();
            }
            () = cancel.cancelled() => {}
        }
        Ok(())
    });

    readiness.set(true);
    info!(tasks = supervisor.len(), "User service started");
    let outcome = supervisor.wait().await;

    if tokio::time::timeout(WRITE_BACK_FLUSH, write_back).await.is_err() {
        warn!("Write-back worker did not finish flushing");
    }

    outcome.map_err(anyhow::Error::from)?;
    info!("Graceful shutdown complete");
    Ok(())
}

async fn connect(config: &Config, init: &OperationContext) -> anyhow::Result<Resources> {
    let store = PostgresUserStore::connect(
        &config.database.url,
        &PoolSettings {
            max_connections: config.database.max_connections,
            min_connections: config.database.min_connections,
            acquire_timeout: config.database.acquire_timeout,
        },
    )
    .await
    .context("Failed to connect to the store")?;
    store.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(store);

    let cache = RedisProjectionCache::new(&config.redis.url, config.redis.operation_timeout)
        .await
        .context("Failed to connect to the cache")?;
    cache.ping().await.context("Cache is not answering")?;

    let client = RedpandaLogConsumer::builder()
        .brokers(&config.kafka.brokers)
        .group_id(&config.kafka.group_id)
        .commit_interval(config.kafka.commit_interval)
        .build()
        .context("Failed to create the broker client")?;
    let handlers = ChangeHandlers::new(
        Arc::clone(&store),
        HandlerSettings::new(config.sync.attempt_timeout, config.sync.max_elapsed),
    );
    let consumer = SyncConsumer::connect(init, client, handlers, &config.kafka.topic)
        .await
        .context("Failed to reach the broker")?;

    Ok(Resources {
        store,
        cache: Arc::new(cache),
        consumer,
    })
}

/// Serve `router` until `cancel` fires, then drain for at most `grace`.
async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let shutdown = cancel.clone();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.context("Server failed"),
        () = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, server).await {
        Ok(result) => result.context("Server failed while draining"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "Grace period elapsed, dropping open connections");
            Ok(())
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to install Ctrl+C handler")?;
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
    Ok(())
}
