//! # Outflow Core
//!
//! Core traits and types for reliable event delivery.
//!
//! This crate defines the contracts shared by every other outflow crate. It holds
//! no I/O of its own: transports, stores and loops live in `outflow-runtime`,
//! `outflow-postgres` and `outflow-redis`.
//!
//! ## Core Concepts
//!
//! - **Envelope**: [`event::EventEnvelope`], the tagged wire format
//!   `{event_id, event_type, version, occurred_at, payload}`
//! - **Stream Transport**: [`stream::StreamTransport`], a durable, ordered,
//!   multi-consumer log with consumer groups
//! - **Event Bus**: [`event_bus::EventBus`], publish/subscribe with at-least-once
//!   delivery, retry and dead-lettering
//! - **Handler**: [`handler::EventHandler`], the consumer callback
//! - **Outbox**: [`outbox::OutboxStore`], event intent written in the same
//!   transaction as the business change
//!
//! ## Delivery Paths
//!
//! ```text
//! durable:          business tx ──► outbox row ──► processor ──► bus.publish ──► handler
//! fire-and-forget:  producer ──► worker pool ──► bus.publish ──► handler
//! ```
//!
//! ## Example
//!
//! ```
//! use outflow_core::event::{DomainEvent, EventEnvelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct TaskAssigned {
//!     task_id: String,
//!     user_id: String,
//! }
//!
//! impl DomainEvent for TaskAssigned {
//!     const EVENT_TYPE: &'static str = "task_assigned_stream";
//! }
//!
//! let event = TaskAssigned { task_id: "T1".into(), user_id: "U1".into() };
//! let envelope = EventEnvelope::from_event(&event).unwrap();
//! assert_eq!(envelope.decode::<TaskAssigned>().unwrap(), event);
//! ```

pub mod event;
pub mod event_bus;
pub mod handler;
pub mod outbox;
pub mod registry;
pub mod stream;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

pub use event::{DomainEvent, EventEnvelope, EventError};
pub use event_bus::{DLQ_SUFFIX, EventBus, EventBusError, dlq_topic};
pub use handler::{EventHandler, HandlerError, TypedHandler, typed_handler};
pub use outbox::{OutboxCounts, OutboxError, OutboxEvent, OutboxStatus, OutboxStore};
pub use registry::EventRegistry;
pub use stream::{EVENT_DATA_FIELD, EntryId, FieldMap, GroupCreation, StreamEntry, StreamTransport, TransportError};

/// Environment module - injected dependencies
///
/// Time is abstracted behind [`Clock`](environment::Clock) so stores and tests can
/// control creation and processing timestamps.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use outflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
