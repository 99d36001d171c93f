//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for every delivery component:
//! - Event bus publish and consumption (deliveries, retries, dead letters)
//! - Outbox processor ticks (published, failed, abandoned rows)
//! - Publish worker pool (accepted, rejected, dispatched jobs)
//!
//! `outbox_events_abandoned_total` and `event_bus_dead_lettered_total` are the alerting
//! hooks: both count events that need operator attention.
//!
//! # Example
//!
//! ```rust,no_run
//! use outflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Expose `server.render()` on your HTTP endpoint for scraping
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

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

/// Prometheus metrics recorder handle.
///
/// Installs the global recorder and renders the scrape payload.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is served on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a warning
    /// and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - serve render() at http://{}/metrics",
                    self.addr
                );
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
pub fn register_metrics() {
    // Event Bus Metrics
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of entries appended by publish"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to publish an entry"
    );
    describe_counter!(
        "event_bus_messages_consumed_total",
        "Total number of entries handled and acknowledged"
    );
    describe_counter!(
        "event_bus_handler_retries_total",
        "Total number of handler retries"
    );
    describe_counter!(
        "event_bus_dead_lettered_total",
        "Total number of entries copied to a dead-letter topic"
    );
    describe_counter!(
        "event_bus_consume_errors_total",
        "Total number of transport errors while consuming"
    );

    // Outbox Metrics
    describe_counter!(
        "outbox_events_published_total",
        "Total number of outbox rows published and marked processed"
    );
    describe_counter!(
        "outbox_events_failed_total",
        "Total number of failed outbox publish attempts"
    );
    describe_counter!(
        "outbox_events_abandoned_total",
        "Total number of outbox rows abandoned at the retry ceiling"
    );
    describe_histogram!(
        "outbox_tick_duration_seconds",
        "Time taken by one outbox processor tick"
    );

    // Worker Pool Metrics
    describe_counter!(
        "worker_pool_jobs_accepted_total",
        "Total number of publish jobs accepted"
    );
    describe_counter!(
        "worker_pool_jobs_rejected_total",
        "Total number of publish jobs rejected (queue full or shutting down)"
    );
    describe_counter!(
        "worker_pool_jobs_dispatched_total",
        "Total number of publish jobs dispatched"
    );
    describe_counter!(
        "worker_pool_dispatch_errors_total",
        "Total number of dispatched jobs whose publish failed"
    );
    describe_gauge!(
        "worker_pool_queue_depth",
        "Jobs waiting in the worker pool queue"
    );
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record an entry publish.
    pub fn record_publish(topic: &str, duration: Duration) {
        counter!("event_bus_messages_published_total", "topic" => topic.to_string()).increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish error.
    pub fn record_publish_error(topic: &str) {
        counter!("event_bus_publish_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an entry handled and acknowledged.
    pub fn record_consume(topic: &str) {
        counter!("event_bus_messages_consumed_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a handler retry.
    pub fn record_retry(topic: &str) {
        counter!("event_bus_handler_retries_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record an entry routed to the dead-letter topic.
    pub fn record_dead_letter(topic: &str) {
        counter!("event_bus_dead_lettered_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a transport error while consuming.
    pub fn record_consume_error(topic: &str) {
        counter!("event_bus_consume_errors_total", "topic" => topic.to_string()).increment(1);
    }
}

/// Outbox processor metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a row published and marked processed.
    pub fn record_published() {
        counter!("outbox_events_published_total").increment(1);
    }

    /// Record a failed publish attempt.
    pub fn record_failed() {
        counter!("outbox_events_failed_total").increment(1);
    }

    /// Record a row abandoned at the retry ceiling.
    pub fn record_abandoned() {
        counter!("outbox_events_abandoned_total").increment(1);
    }

    /// Record one tick.
    pub fn record_tick(duration: Duration) {
        histogram!("outbox_tick_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Worker pool metrics recorder.
pub struct WorkerPoolMetrics;

impl WorkerPoolMetrics {
    /// Record an accepted job.
    pub fn record_accepted() {
        counter!("worker_pool_jobs_accepted_total").increment(1);
    }

    /// Record a rejected job.
    pub fn record_rejected(reason: &'static str) {
        counter!("worker_pool_jobs_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a dispatched job.
    pub fn record_dispatched() {
        counter!("worker_pool_jobs_dispatched_total").increment(1);
    }

    /// Record a dispatched job whose publish failed.
    pub fn record_dispatch_error() {
        counter!("worker_pool_dispatch_errors_total").increment(1);
    }

    /// Record the current queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_queue_depth(depth: usize) {
        gauge!("worker_pool_queue_depth").set(depth as f64);
    }
}
