//! # Outflow Testing
//!
//! Testing utilities for code built on outflow.
//!
//! This crate provides:
//! - [`InMemoryStreamTransport`]: consumer-group log with failure injection
//! - [`InMemoryOutboxStore`]: outbox with real commit/rollback semantics
//! - [`RecordingEventBus`]: captures publishes, can fail or pause on demand
//! - [`FixedClock`]: deterministic time
//! - [`helpers`]: polling and tracing helpers for async tests
//!
//! ## Example
//!
//! ```
//! use outflow_core::outbox::{OutboxEvent, OutboxStore};
//! use outflow_testing::InMemoryOutboxStore;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryOutboxStore::new();
//!
//! let mut tx = store.begin();
//! let event = OutboxEvent::new("task", "T1", "task_assigned_stream", json!({"task_id": "T1"}));
//! store.create(&mut tx, &event).await.unwrap();
//! tx.rollback();
//!
//! assert!(store.get_unprocessed(10).await.unwrap().is_empty());
//! # });
//! ```

pub mod event_bus;
pub mod outbox;
pub mod transport;

use chrono::{DateTime, Utc};
use outflow_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`advance`](FixedClock::advance) is called. Clones
    /// share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use outflow_testing::mocks::FixedClock;
    /// use outflow_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::seconds(5));
    /// assert_eq!(clock.now() - time1, Duration::seconds(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)] // Test infrastructure
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)] // Test infrastructure
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition held. Background loops (subscriptions, workers,
    /// the outbox processor) finish their work asynchronously, so tests wait on the
    /// observable effect instead of sleeping for a fixed time.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Install a test-writer tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`; repeated calls are no-ops.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "outflow=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use event_bus::RecordingEventBus;
pub use mocks::{FixedClock, test_clock};
pub use outbox::{InMemoryOutboxStore, InMemoryTransaction};
pub use transport::InMemoryStreamTransport;
