//! Event bus abstraction for propagating domain events to asynchronous consumers.
//!
//! This module provides the [`EventBus`] trait for publishing envelopes to topics and
//! registering handlers that consume them through a consumer group.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────┐
//! │ Outbox Processor │      │ Worker Pool  │
//! │ (durable path)   │      │ (best effort)│
//! └────────┬─────────┘      └──────┬───────┘
//!          │                       │
//!          └──────────┬────────────┘
//!                     ▼
//!           ┌──────────────────┐
//!           │  EventBus        │
//!           │  .publish(topic) │
//!           └────────┬─────────┘
//!                    │  append
//!                    ▼
//!           ┌──────────────────┐
//!           │ Stream Transport │◄─── durable, ordered log
//!           └────────┬─────────┘
//!                    │  consumer group read
//!                    ▼
//!           ┌──────────────────┐    fails after retries    ┌────────────┐
//!           │  handler         │ ─────────────────────────►│ {topic}_dlq│
//!           └──────────────────┘                           └────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: An entry may reach a handler more than once
//! - **Idempotency**: Handlers must tolerate duplicates (deduplicate on `event_id`)
//! - **Bounded retry**: A failing entry is retried a fixed number of times, then
//!   copied to `"{topic}_dlq"` and acknowledged on the original topic
//! - **Malformed entries skip retry**: An entry that can never be decoded goes to the
//!   dead-letter topic on first failure
//!
//! # Ordering
//!
//! Entries are read in log order per (topic, consumer). Ordering across entries is
//! **not** preserved once an entry needs a retry: later entries of the same batch
//! complete while the failing entry waits out its backoff. Consumers that need strict
//! per-aggregate ordering must not rely on delivery order.
//!
//! # Topic Naming Convention
//!
//! The event type doubles as the topic (`task_assigned_stream`). Dead letters go to
//! the topic name with [`DLQ_SUFFIX`] appended (`task_assigned_stream_dlq`).

use crate::event::EventEnvelope;
use crate::handler::EventHandler;
use crate::stream::EntryId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Suffix appended to a topic name to form its dead-letter topic.
pub const DLQ_SUFFIX: &str = "_dlq";

/// Name of the dead-letter topic for `topic`.
///
/// # Examples
///
/// ```
/// use outflow_core::event_bus::dlq_topic;
///
/// assert_eq!(dlq_topic("task_assigned_stream"), "task_assigned_stream_dlq");
/// ```
#[must_use]
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}{DLQ_SUFFIX}")
}

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// A handler is already registered for this topic on this bus
    #[error("Topic '{0}' already has a subscription on this bus")]
    AlreadySubscribed(String),

    /// Failed to serialize an envelope
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The bus has been closed
    #[error("Event bus is closed")]
    Closed,
}

/// Trait for event bus implementations.
///
/// # Design Principles
///
/// - **Async-first**: All operations are async for non-blocking I/O
/// - **Background delivery**: `subscribe` returns once the consumer group exists;
///   handlers run on a background task per topic
/// - **At-least-once**: Handlers may receive duplicate envelopes
/// - **Never fatal**: Transport and handler errors never stop a subscription loop
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` so one instance can be shared by the
/// outbox processor, the worker pool and every subscriber.
///
/// # Examples
///
/// ```rust,ignore
/// use outflow_core::event::EventEnvelope;
/// use outflow_core::handler::HandlerError;
/// use std::sync::Arc;
///
/// bus.subscribe("task_assigned_stream", Arc::new(|envelope: EventEnvelope| async move {
///     tracing::info!(event_id = %envelope.event_id, "task assigned");
///     Ok::<_, HandlerError>(())
/// })).await?;
///
/// let envelope = EventEnvelope::new("task_assigned_stream", 1, serde_json::json!({"task_id": "T1"}));
/// bus.publish("task_assigned_stream", &envelope).await?;
/// ```
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`).
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// Returns the transport-assigned id of the appended entry.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the append fails and
    /// [`EventBusError::SerializationFailed`] if the envelope cannot be encoded.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventBusError>> + Send + '_>>;

    /// Register `handler` for `topic` within this bus's consumer group.
    ///
    /// Ensures the consumer group exists, then starts a background loop that first
    /// replays entries left pending by a previous run of this consumer and then reads
    /// new entries in batches.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the consumer group cannot be
    /// created, [`EventBusError::AlreadySubscribed`] if `topic` already has a handler
    /// on this bus and [`EventBusError::Closed`] after [`close`](EventBus::close).
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Stop every subscription loop and wait for them to exit.
    ///
    /// Entries that were delivered but not yet acknowledged stay pending and are
    /// replayed on the next subscription by the same consumer.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_topic_appends_suffix() {
        assert_eq!(dlq_topic("orders"), "orders_dlq");
        assert!(dlq_topic("orders").ends_with(DLQ_SUFFIX));
    }

    #[test]
    fn publish_failed_message() {
        let err = EventBusError::PublishFailed {
            topic: "orders".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "Publish failed for topic 'orders': timeout");
    }
}
