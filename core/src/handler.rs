//! Consumer callbacks invoked by the event bus.
//!
//! A handler receives one [`EventEnvelope`] at a time and reports success or failure.
//! Failures are split in two:
//!
//! - [`HandlerError::Failed`]: a transient problem (SMTP timeout, downstream 503).
//!   The bus retries with backoff.
//! - [`HandlerError::Malformed`]: the envelope can never be processed. The bus sends
//!   it to the dead-letter topic without retrying.
//!
//! Plain async closures implement [`EventHandler`] directly. [`typed_handler`] wraps a
//! closure over a concrete [`DomainEvent`] and turns decode failures into
//! [`HandlerError::Malformed`].

use crate::event::{DomainEvent, EventEnvelope, EventError};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use thiserror::Error;

/// Error returned by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed and may succeed on a later attempt
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The envelope can never be processed
    #[error("Malformed event: {0}")]
    Malformed(String),
}

impl HandlerError {
    /// Shorthand for a retryable failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Shorthand for a non-retryable failure.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Whether the bus should retry the entry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<EventError> for HandlerError {
    fn from(err: EventError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Consumer callback for one topic.
///
/// Handlers must be idempotent: the same envelope (same `event_id`) can be delivered
/// more than once after a crash or a failed acknowledgement.
pub trait EventHandler: Send + Sync {
    /// Process one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] when the envelope was not processed.
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin((self)(envelope.clone()))
    }
}

/// Handler that decodes the envelope into `E` before calling the inner closure.
///
/// Built with [`typed_handler`].
pub struct TypedHandler<E, F> {
    f: F,
    _event: PhantomData<fn() -> E>,
}

impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: DomainEvent,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        match envelope.decode::<E>() {
            Ok(event) => Box::pin((self.f)(event)),
            Err(err) => Box::pin(std::future::ready(Err(HandlerError::from(err)))),
        }
    }
}

/// Wrap a closure over a typed domain event.
///
/// # Examples
///
/// ```
/// use outflow_core::event::{DomainEvent, EventEnvelope};
/// use outflow_core::handler::{EventHandler, HandlerError, typed_handler};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct TaskDone {
///     task_id: String,
/// }
///
/// impl DomainEvent for TaskDone {
///     const EVENT_TYPE: &'static str = "task_done_stream";
/// }
///
/// let handler = typed_handler(|event: TaskDone| async move {
///     if event.task_id.is_empty() {
///         return Err(HandlerError::malformed("empty task id"));
///     }
///     Ok(())
/// });
///
/// let envelope = EventEnvelope::from_event(&TaskDone { task_id: "T1".into() }).unwrap();
/// # tokio_test::block_on(async {
/// assert!(handler.handle(&envelope).await.is_ok());
/// # });
/// ```
pub fn typed_handler<E, F, Fut>(f: F) -> TypedHandler<E, F>
where
    E: DomainEvent,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    TypedHandler {
        f,
        _event: PhantomData,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct TaskDone {
        task_id: String,
    }

    impl DomainEvent for TaskDone {
        const EVENT_TYPE: &'static str = "task_done_stream";
    }

    #[tokio::test]
    async fn closure_handler_receives_envelope() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = move |envelope: EventEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(envelope.event_type, "task_done_stream");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        };

        let envelope = EventEnvelope::new("task_done_stream", 1, json!({"task_id": "T1"}));
        handler.handle(&envelope).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typed_handler_marks_decode_failures_malformed() {
        let handler = typed_handler(|_event: TaskDone| async { Ok::<_, HandlerError>(()) });
        let envelope = EventEnvelope::new("task_assigned_stream", 1, json!({}));

        let err = handler.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn typed_handler_passes_failures_through() {
        let handler = typed_handler(|event: TaskDone| async move {
            Err::<(), _>(HandlerError::failed(format!("smtp down for {}", event.task_id)))
        });
        let envelope = EventEnvelope::new("task_done_stream", 1, json!({"task_id": "T7"}));

        let err = handler.handle(&envelope).await.unwrap_err();
        assert_eq!(err, HandlerError::Failed("smtp down for T7".into()));
        assert!(err.is_retryable());
    }
}
