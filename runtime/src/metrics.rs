//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the user service components:
//! - Lifecycle event synchronization (messages, handler latency, retries)
//! - Projection cache reads and write-backs
//! - Store fallback reads
//!
//! # Example
//!
//! ```rust,no_run
//! use user_service_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` on /metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Lifecycle messages seen by the sync consumer, labelled by `outcome`.
pub const SYNC_MESSAGES_TOTAL: &str = "user_sync_messages_total";
/// Handler invocations that gave up after the retry budget.
pub const SYNC_HANDLER_FAILURES_TOTAL: &str = "user_sync_handler_failures_total";
/// Handler attempts made after a failed attempt.
pub const SYNC_HANDLER_RETRIES_TOTAL: &str = "user_sync_handler_retries_total";
/// Time spent in one handler invocation including retries.
pub const SYNC_HANDLER_DURATION: &str = "user_sync_handler_duration_seconds";
/// Offsets that could not be stored after successful handling.
pub const SYNC_OFFSET_STORE_ERRORS_TOTAL: &str = "user_sync_offset_store_errors_total";
/// Projection cache hits.
pub const CACHE_HITS_TOTAL: &str = "user_cache_hits_total";
/// Projection cache misses.
pub const CACHE_MISSES_TOTAL: &str = "user_cache_misses_total";
/// Projection cache transport or decoding failures.
pub const CACHE_ERRORS_TOTAL: &str = "user_cache_errors_total";
/// Write-back entries dropped because the queue was full.
pub const CACHE_WRITE_BACK_DROPPED_TOTAL: &str = "user_cache_write_back_dropped_total";
/// Write-back entries the cache rejected.
pub const CACHE_WRITE_BACK_FAILURES_TOTAL: &str = "user_cache_write_back_failures_total";
/// Reads answered by the store after a cache miss or failure.
pub const STORE_FALLBACK_READS_TOTAL: &str = "user_store_fallback_reads_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder bound to the address its scrape endpoint is served on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint binds to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint should bind to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and leaves the server without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                    60.0, 120.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Sync Metrics
    describe_counter!(
        SYNC_MESSAGES_TOTAL,
        "Lifecycle messages seen by the sync consumer, by outcome"
    );
    describe_counter!(
        SYNC_HANDLER_FAILURES_TOTAL,
        "Handler invocations that exhausted their retry budget"
    );
    describe_counter!(
        SYNC_HANDLER_RETRIES_TOTAL,
        "Store attempts retried by the change handlers"
    );
    describe_histogram!(
        SYNC_HANDLER_DURATION,
        "Time taken to apply one lifecycle event, retries included"
    );
    describe_counter!(
        SYNC_OFFSET_STORE_ERRORS_TOTAL,
        "Offsets that could not be stored after handling"
    );

    // Cache Metrics
    describe_counter!(CACHE_HITS_TOTAL, "Projection cache hits");
    describe_counter!(CACHE_MISSES_TOTAL, "Projection cache misses");
    describe_counter!(CACHE_ERRORS_TOTAL, "Projection cache failures");
    describe_counter!(
        CACHE_WRITE_BACK_DROPPED_TOTAL,
        "Write-back entries dropped on a full queue"
    );
    describe_counter!(
        CACHE_WRITE_BACK_FAILURES_TOTAL,
        "Write-back entries rejected by the cache"
    );

    // Store Metrics
    describe_counter!(
        STORE_FALLBACK_READS_TOTAL,
        "Projection reads answered by the store"
    );
}

/// How the sync consumer disposed of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Applied to the store.
    Applied,
    /// Acknowledged without a handler (foreign or unspecified).
    Skipped,
    /// Left unacknowledged.
    Failed,
}

impl SyncOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Sync consumer metrics recorder.
pub struct SyncMetrics;

impl SyncMetrics {
    /// Record the outcome of one message.
    pub fn record_message(outcome: SyncOutcome) {
        counter!(SYNC_MESSAGES_TOTAL, "outcome" => outcome.as_str()).increment(1);
    }

    /// Record one handler invocation.
    pub fn record_handler(change_type: &'static str, duration: Duration) {
        histogram!(SYNC_HANDLER_DURATION, "change_type" => change_type)
            .record(duration.as_secs_f64());
    }

    /// Record one retried store attempt.
    pub fn record_handler_retry(change_type: &'static str) {
        counter!(SYNC_HANDLER_RETRIES_TOTAL, "change_type" => change_type).increment(1);
    }

    /// Record a handler that gave up.
    pub fn record_handler_failure(change_type: &'static str) {
        counter!(SYNC_HANDLER_FAILURES_TOTAL, "change_type" => change_type).increment(1);
    }

    /// Record a failed offset store.
    pub fn record_offset_store_error() {
        counter!(SYNC_OFFSET_STORE_ERRORS_TOTAL).increment(1);
    }
}

/// Projection cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record cache hits.
    pub fn record_hits(count: usize) {
        counter!(CACHE_HITS_TOTAL).increment(count as u64);
    }

    /// Record cache misses.
    pub fn record_misses(count: usize) {
        counter!(CACHE_MISSES_TOTAL).increment(count as u64);
    }

    /// Record a cache failure.
    pub fn record_error() {
        counter!(CACHE_ERRORS_TOTAL).increment(1);
    }

    /// Record a write-back dropped on a full queue.
    pub fn record_write_back_dropped() {
        counter!(CACHE_WRITE_BACK_DROPPED_TOTAL).increment(1);
    }

    /// Record a write-back the cache rejected.
    pub fn record_write_back_failure() {
        counter!(CACHE_WRITE_BACK_FAILURES_TOTAL).increment(1);
    }
}

/// Store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a projection read answered by the store.
    pub fn record_fallback_read() {
        counter!(STORE_FALLBACK_READS_TOTAL).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert_eq!(server.addr(), addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_recorders_without_installed_recorder() {
        // Recording without a global recorder is a no-op
        SyncMetrics::record_message(SyncOutcome::Applied);
        SyncMetrics::record_handler("registered", Duration::from_millis(3));
        SyncMetrics::record_handler_retry("registered");
        CacheMetrics::record_hits(2);
        StoreMetrics::record_fallback_read();
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(SyncOutcome::Applied.as_str(), "applied");
        assert_eq!(SyncOutcome::Skipped.as_str(), "skipped");
        assert_eq!(SyncOutcome::Failed.as_str(), "failed");
    }
}
