//! # Outflow Runtime
//!
//! Runtime components for reliable event delivery.
//!
//! ## Core Components
//!
//! - **[`StreamEventBus`]**: publish/subscribe over any
//!   [`StreamTransport`](outflow_core::stream::StreamTransport) with consumer groups,
//!   pending-entry replay, linear retry and dead-lettering
//! - **[`WorkerPool`]**: bounded, non-blocking queue of fire-and-forget publishes
//! - **[`OutboxProcessor`]**: periodic relay from an
//!   [`OutboxStore`](outflow_core::outbox::OutboxStore) to the bus
//!
//! All three stop on a shared [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! ## Example
//!
//! ```ignore
//! use outflow_runtime::{OutboxProcessor, StreamEventBus, WorkerPool};
//! use outflow_runtime::config::OutflowConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = OutflowConfig::from_env();
//! let shutdown = CancellationToken::new();
//!
//! let bus: Arc<dyn EventBus> = Arc::new(
//!     StreamEventBus::new(transport, "notifications")
//!         .with_config(config.bus.clone())
//!         .with_cancellation(&shutdown),
//! );
//! let processor = OutboxProcessor::new(store, Arc::clone(&bus), config.outbox.clone())
//!     .spawn(shutdown.clone());
//! let pool = WorkerPool::new(Arc::clone(&bus), &config.workers);
//! ```

/// Event bus over a stream transport
pub mod bus;

/// Runtime configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox polling and relay
pub mod outbox_processor;

/// Retry policies
pub mod retry;

/// Bounded publish worker pool
pub mod worker_pool;

pub use bus::{StreamEventBus, default_consumer_name};
pub use config::{BusConfig, OutboxConfig, OutflowConfig, WorkerPoolConfig};
pub use outbox_processor::{OutboxProcessor, TickReport};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use worker_pool::{PublishJob, WorkerPool, WorkerPoolError};
