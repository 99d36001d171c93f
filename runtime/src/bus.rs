//! Event bus over any [`StreamTransport`].
//!
//! [`StreamEventBus`] implements the delivery protocol once, and every transport
//! (Redis Streams in production, the in-memory log in tests) only supplies the raw
//! log operations.
//!
//! # Subscription loop
//!
//! ```text
//! subscribe(topic)
//!   └─ create_group (already exists is fine)
//!   └─ spawn:
//!        replay pending entries of this consumer, batch by batch
//!        loop until cancelled:
//!            read_new(batch_size, block_timeout)
//!            first attempt of every entry, in order
//!               ok        → ack
//!               malformed → dead-letter, ack
//!               failed    → retry concurrently with linear backoff
//!                             ok        → ack
//!                             exhausted → dead-letter, ack
//! ```
//!
//! An entry whose dead-letter append fails is not acknowledged. It stays pending and
//! is replayed by the next subscription of the same consumer.

use crate::config::BusConfig;
use crate::metrics::EventBusMetrics;
use crate::retry::RetryPolicy;
use futures::FutureExt;
use futures::future::join_all;
use outflow_core::event::EventEnvelope;
use outflow_core::event_bus::{EventBus, EventBusError, dlq_topic};
use outflow_core::handler::{EventHandler, HandlerError};
use outflow_core::registry::EventRegistry;
use outflow_core::stream::{
    EVENT_DATA_FIELD, EntryId, FieldMap, GroupCreation, StreamEntry, StreamTransport,
};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consumer name used when none is configured: `"{hostname}-{pid}"`.
///
/// Entries left pending by a crash are only replayed by a consumer with the same name,
/// so deployments that restart in place should set a stable name with
/// [`StreamEventBus::with_consumer_name`].
#[must_use]
pub fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}-{}", std::process::id())
}

/// Publish/subscribe with consumer groups, retry and dead-lettering.
///
/// # Example
///
/// ```
/// use outflow_core::event::EventEnvelope;
/// use outflow_core::event_bus::EventBus;
/// use outflow_core::handler::HandlerError;
/// use outflow_runtime::StreamEventBus;
/// use outflow_testing::InMemoryStreamTransport;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let bus = StreamEventBus::new(Arc::new(InMemoryStreamTransport::new()), "notifications");
///
/// bus.subscribe("task_done_stream", Arc::new(|envelope: EventEnvelope| async move {
///     println!("task done: {}", envelope.payload);
///     Ok::<_, HandlerError>(())
/// }))
/// .await
/// .unwrap();
///
/// let envelope = EventEnvelope::new("task_done_stream", 1, serde_json::json!({"task_id": "T1"}));
/// bus.publish("task_done_stream", &envelope).await.unwrap();
/// bus.close().await;
/// # });
/// ```
pub struct StreamEventBus<T: StreamTransport> {
    transport: Arc<T>,
    group: String,
    consumer: String,
    config: BusConfig,
    registry: Option<Arc<EventRegistry>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<T: StreamTransport> StreamEventBus<T> {
    /// Create a bus consuming as `group` with the default consumer name and config.
    #[must_use]
    pub fn new(transport: Arc<T>, group: impl Into<String>) -> Self {
        Self {
            transport,
            group: group.into(),
            consumer: default_consumer_name(),
            config: BusConfig::default(),
            registry: None,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the consumer name.
    #[must_use]
    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Override the consumption settings. A `batch_size` of 0 is raised to 1.
    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = BusConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        self
    }

    /// Dead-letter envelopes whose type is not in `registry` or does not decode.
    #[must_use]
    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Stop subscription loops when `parent` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Consumer group name.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Consumer name within the group.
    #[must_use]
    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    /// Consumption settings.
    #[must_use]
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Topics with a running subscription.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl<T: StreamTransport> EventBus for StreamEventBus<T> {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let encoded = envelope.to_bytes();
        let event_id = envelope.event_id;

        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }
            let data = encoded.map_err(|e| EventBusError::SerializationFailed(e.to_string()))?;

            let mut fields = FieldMap::new();
            fields.insert(EVENT_DATA_FIELD.to_string(), data);

            let start = Instant::now();
            match self.transport.append(&topic, fields).await {
                Ok(id) => {
                    EventBusMetrics::record_publish(&topic, start.elapsed());
                    tracing::debug!(topic = %topic, entry_id = %id, event_id = %event_id, "Published event");
                    Ok(id)
                }
                Err(e) => {
                    EventBusMetrics::record_publish_error(&topic);
                    tracing::warn!(topic = %topic, event_id = %event_id, error = %e, "Failed to publish event");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: e.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();

        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }

            let mut subscriptions = self.subscriptions.lock().await;
            if subscriptions.contains_key(&topic) {
                return Err(EventBusError::AlreadySubscribed(topic));
            }

            match self.transport.create_group(&topic, &self.group).await {
                Ok(GroupCreation::Created) => {
                    tracing::info!(topic = %topic, group = %self.group, "Created consumer group");
                }
                Ok(GroupCreation::AlreadyExists) => {
                    tracing::debug!(topic = %topic, group = %self.group, "Consumer group already exists");
                }
                Err(e) => {
                    return Err(EventBusError::SubscriptionFailed {
                        topic,
                        reason: e.to_string(),
                    });
                }
            }

            let subscription = Subscription {
                transport: Arc::clone(&self.transport),
                topic: topic.clone(),
                group: self.group.clone(),
                consumer: self.consumer.clone(),
                config: self.config.clone(),
                policy: RetryPolicy::from(&self.config),
                registry: self.registry.clone(),
                handler,
                cancel: self.cancel.child_token(),
            };

            tracing::info!(
                topic = %topic,
                group = %self.group,
                consumer = %self.consumer,
                "Subscribed to topic"
            );
            subscriptions.insert(topic, tokio::spawn(subscription.run()));
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.cancel.cancel();

            let handles: Vec<(String, JoinHandle<()>)> =
                self.subscriptions.lock().await.drain().collect();
            for (topic, handle) in handles {
                if let Err(e) = handle.await {
                    tracing::error!(topic = %topic, error = %e, "Subscription task panicked");
                }
            }
            tracing::info!(group = %self.group, consumer = %self.consumer, "Event bus closed");
        })
    }
}

/// Result of the first, in-order delivery attempt of an entry.
enum FirstAttempt {
    Handled,
    Empty,
    Malformed(String),
    Failed(EventEnvelope, String),
}

/// One topic's consumption loop.
struct Subscription<T: StreamTransport> {
    transport: Arc<T>,
    topic: String,
    group: String,
    consumer: String,
    config: BusConfig,
    policy: RetryPolicy,
    registry: Option<Arc<EventRegistry>>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl<T: StreamTransport> Subscription<T> {
    async fn run(self) {
        self.replay_pending().await;

        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                read = self.transport.read_new(
                    &self.topic,
                    &self.group,
                    &self.consumer,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => read,
            };

            match read {
                Ok(entries) if entries.is_empty() => {}
                Ok(entries) => {
                    tracing::trace!(topic = %self.topic, count = entries.len(), "Read batch");
                    self.process_batch(entries).await;
                }
                Err(e) => {
                    EventBusMetrics::record_consume_error(&self.topic);
                    tracing::warn!(topic = %self.topic, error = %e, "Failed to read from stream");
                    if !self.pause(self.config.error_backoff).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(topic = %self.topic, consumer = %self.consumer, "Subscription stopped");
    }

    /// Redeliver entries this consumer received but never acknowledged.
    async fn replay_pending(&self) {
        let mut after: Option<EntryId> = None;
        let mut replayed = 0_usize;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let read = self
                .transport
                .read_pending(
                    &self.topic,
                    &self.group,
                    &self.consumer,
                    after.as_ref(),
                    self.config.batch_size,
                )
                .await;

            match read {
                Ok(entries) => {
                    let count = entries.len();
                    if let Some(last) = entries.last() {
                        after = Some(last.id.clone());
                    }
                    if count > 0 {
                        replayed += count;
                        self.process_batch(entries).await;
                    }
                    if count < self.config.batch_size {
                        break;
                    }
                }
                Err(e) => {
                    EventBusMetrics::record_consume_error(&self.topic);
                    tracing::warn!(topic = %self.topic, error = %e, "Failed to read pending entries");
                    if !self.pause(self.config.error_backoff).await {
                        return;
                    }
                }
            }
        }

        if replayed > 0 {
            tracing::info!(topic = %self.topic, count = replayed, "Replayed pending entries");
        }
    }

    async fn process_batch(&self, entries: Vec<StreamEntry>) {
        let mut failed = Vec::new();

        for entry in entries {
            match self.first_attempt(&entry).await {
                FirstAttempt::Handled => {
                    EventBusMetrics::record_consume(&self.topic);
                    self.ack(&entry).await;
                }
                FirstAttempt::Empty => {
                    // Nothing to copy to the DLQ (streams reject field-less appends)
                    EventBusMetrics::record_consume_error(&self.topic);
                    tracing::warn!(topic = %self.topic, entry_id = %entry.id, "Dropping entry without fields");
                    self.ack(&entry).await;
                }
                FirstAttempt::Malformed(reason) => self.dead_letter(&entry, &reason).await,
                FirstAttempt::Failed(envelope, reason) => failed.push((entry, envelope, reason)),
            }
        }

        if !failed.is_empty() {
            join_all(
                failed
                    .into_iter()
                    .map(|(entry, envelope, reason)| self.retry(entry, envelope, reason)),
            )
            .await;
        }
    }

    async fn first_attempt(&self, entry: &StreamEntry) -> FirstAttempt {
        if entry.fields.is_empty() {
            return FirstAttempt::Empty;
        }

        let envelope = match self.decode(entry) {
            Ok(envelope) => envelope,
            Err(reason) => return FirstAttempt::Malformed(reason),
        };

        match self.invoke(&envelope).await {
            Ok(()) => FirstAttempt::Handled,
            Err(HandlerError::Malformed(reason)) => FirstAttempt::Malformed(reason),
            Err(HandlerError::Failed(reason)) => FirstAttempt::Failed(envelope, reason),
        }
    }

    fn decode(&self, entry: &StreamEntry) -> Result<EventEnvelope, String> {
        let data = entry
            .event_data()
            .ok_or_else(|| format!("missing '{EVENT_DATA_FIELD}' field"))?;
        let envelope = EventEnvelope::from_bytes(data).map_err(|e| e.to_string())?;
        if let Some(registry) = &self.registry {
            registry.validate(&envelope).map_err(|e| e.to_string())?;
        }
        Ok(envelope)
    }

    async fn invoke(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        AssertUnwindSafe(self.handler.handle(envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")))
    }

    async fn retry(&self, entry: StreamEntry, envelope: EventEnvelope, mut last_error: String) {
        for retry in 1..=self.policy.max_retries {
            let delay = self.policy.delay_for_retry(retry);
            tracing::warn!(
                topic = %self.topic,
                entry_id = %entry.id,
                event_id = %envelope.event_id,
                attempt = retry,
                delay_ms = delay.as_millis(),
                error = %last_error,
                "Handler failed, retrying"
            );

            if !self.pause(delay).await {
                tracing::debug!(topic = %self.topic, entry_id = %entry.id, "Cancelled during retry, entry stays pending");
                return;
            }

            EventBusMetrics::record_retry(&self.topic);
            match self.invoke(&envelope).await {
                Ok(()) => {
                    tracing::info!(topic = %self.topic, entry_id = %entry.id, attempt = retry, "Retry succeeded");
                    EventBusMetrics::record_consume(&self.topic);
                    self.ack(&entry).await;
                    return;
                }
                Err(HandlerError::Malformed(reason)) => {
                    self.dead_letter(&entry, &reason).await;
                    return;
                }
                Err(HandlerError::Failed(reason)) => last_error = reason,
            }
        }

        self.dead_letter(&entry, &last_error).await;
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) {
        let dlq = dlq_topic(&self.topic);
        match self.transport.append(&dlq, entry.fields.clone()).await {
            Ok(dlq_id) => {
                EventBusMetrics::record_dead_letter(&self.topic);
                tracing::error!(
                    topic = %self.topic,
                    entry_id = %entry.id,
                    dlq_topic = %dlq,
                    dlq_entry_id = %dlq_id,
                    reason = %reason,
                    "Moved entry to dead-letter topic"
                );
                self.ack(entry).await;
            }
            Err(e) => {
                EventBusMetrics::record_consume_error(&self.topic);
                tracing::error!(
                    topic = %self.topic,
                    entry_id = %entry.id,
                    dlq_topic = %dlq,
                    error = %e,
                    "Failed to move entry to dead-letter topic, leaving it pending"
                );
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) {
        if let Err(e) = self.transport.ack(&self.topic, &self.group, &entry.id).await {
            EventBusMetrics::record_consume_error(&self.topic);
            tracing::warn!(topic = %self.topic, entry_id = %entry.id, error = %e, "Failed to acknowledge entry");
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
