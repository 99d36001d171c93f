//! Recording event bus for producer-side tests.
//!
//! [`RecordingEventBus`] keeps every successful publish in memory and hands it to any
//! handler subscribed to the topic. Publishes can be made to fail or to wait until the
//! test releases them, which is how worker pool and processor tests control timing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use outflow_core::event::EventEnvelope;
use outflow_core::event_bus::{EventBus, EventBusError};
use outflow_core::handler::{EventHandler, HandlerError};
use outflow_core::stream::EntryId;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct Recorded {
    published: Vec<(String, EventEnvelope)>,
    handler_errors: Vec<HandlerError>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    failing_topics: HashSet<String>,
}

/// Event bus double that records publishes.
///
/// Clones share the same recording.
///
/// # Example
///
/// ```
/// use outflow_core::event::EventEnvelope;
/// use outflow_core::event_bus::EventBus;
/// use outflow_testing::RecordingEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = RecordingEventBus::new();
/// bus.fail_next(1);
///
/// let envelope = EventEnvelope::new("orders", 1, serde_json::json!({}));
/// assert!(bus.publish("orders", &envelope).await.is_err());
/// bus.publish("orders", &envelope).await.unwrap();
///
/// assert_eq!(bus.published_to("orders").len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct RecordingEventBus {
    recorded: Arc<Mutex<Recorded>>,
    fail_next: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    delay: Option<Duration>,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RecordingEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecordingEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEventBus")
            .field("published", &self.published().len())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

impl RecordingEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            fail_next: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            delay: None,
            paused: Arc::new(paused),
        }
    }

    /// Sleep for `delay` inside every publish.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every publish to `topic` fail until [`heal_topic`](Self::heal_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.recorded
            .lock()
            .unwrap()
            .failing_topics
            .insert(topic.to_string());
    }

    /// Stop failing publishes to `topic`.
    pub fn heal_topic(&self, topic: &str) {
        self.recorded.lock().unwrap().failing_topics.remove(topic);
    }

    /// Hold every publish (after it counted as an attempt) until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release held publishes.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Publishes started so far, including failed and held ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every successful publish in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.recorded.lock().unwrap().published.clone()
    }

    /// Envelopes successfully published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<EventEnvelope> {
        self.recorded
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Errors returned by subscribed handlers.
    #[must_use]
    pub fn handler_errors(&self) -> Vec<HandlerError> {
        self.recorded.lock().unwrap().handler_errors.clone()
    }

    /// Whether [`EventBus::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EventBus for RecordingEventBus {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let mut paused = self.paused.subscribe();
            let _ = paused.wait_for(|held| !*held).await;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }
            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let handler = {
                let mut recorded = self.recorded.lock().unwrap();
                if injected || recorded.failing_topics.contains(&topic) {
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: "injected publish failure".into(),
                    });
                }
                recorded.published.push((topic.clone(), envelope.clone()));
                recorded.handlers.get(&topic).cloned()
            };

            let id = EntryId::new(format!("{}-0", self.published().len()));
            if let Some(handler) = handler {
                if let Err(e) = handler.handle(&envelope).await {
                    self.recorded.lock().unwrap().handler_errors.push(e);
                }
            }
            Ok(id)
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
            let mut recorded = self.recorded.lock().unwrap();
            if recorded.handlers.contains_key(&topic) {
                return Err(EventBusError::AlreadySubscribed(topic));
            }
            recorded.handlers.insert(topic, handler);
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}
