//! Registry of event types a consumer knows how to decode.
//!
//! An entry whose `event_type` is not registered, or whose payload does not decode
//! into the registered type, is malformed and goes to the dead-letter topic without
//! retries. Subscribers that do not configure a registry accept every envelope.

use crate::event::{DomainEvent, EventEnvelope, EventError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Validator = Arc<dyn Fn(&EventEnvelope) -> Result<(), EventError> + Send + Sync>;

/// Maps `event_type` strings to payload validators.
///
/// # Examples
///
/// ```
/// use outflow_core::event::{DomainEvent, EventEnvelope, EventError};
/// use outflow_core::registry::EventRegistry;
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
/// let registry = EventRegistry::new().register::<TaskDone>();
/// let envelope = EventEnvelope::new("order_placed", 1, serde_json::json!({}));
/// assert!(matches!(registry.validate(&envelope), Err(EventError::UnknownEventType(_))));
/// ```
#[derive(Clone, Default)]
pub struct EventRegistry {
    validators: HashMap<String, Validator>,
}

impl EventRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `E::EVENT_TYPE`.
    #[must_use]
    pub fn register<E: DomainEvent>(mut self) -> Self {
        self.validators.insert(
            E::EVENT_TYPE.to_string(),
            Arc::new(|envelope: &EventEnvelope| envelope.decode::<E>().map(|_| ())),
        );
        self
    }

    /// Whether `event_type` is registered.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.validators.contains_key(event_type)
    }

    /// Check that the envelope's type is known and its payload decodes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventType`] for unregistered types, otherwise the
    /// decode error of the registered type.
    pub fn validate(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        let validator = self
            .validators
            .get(&envelope.event_type)
            .ok_or_else(|| EventError::UnknownEventType(envelope.event_type.clone()))?;
        validator(envelope)
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether no event type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("EventRegistry").field("event_types", &types).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct TaskAssigned {
        task_id: String,
        user_id: String,
    }

    impl DomainEvent for TaskAssigned {
        const EVENT_TYPE: &'static str = "task_assigned_stream";
    }

    #[test]
    fn validates_registered_type() {
        let registry = EventRegistry::new().register::<TaskAssigned>();
        let envelope = EventEnvelope::new(
            "task_assigned_stream",
            1,
            json!({"task_id": "T1", "user_id": "U1"}),
        );

        assert!(registry.contains("task_assigned_stream"));
        assert_eq!(registry.len(), 1);
        registry.validate(&envelope).unwrap();
    }

    #[test]
    fn rejects_registered_type_with_bad_payload() {
        let registry = EventRegistry::new().register::<TaskAssigned>();
        let envelope = EventEnvelope::new("task_assigned_stream", 1, json!({"task_id": "T1"}));

        assert!(matches!(
            registry.validate(&envelope),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn empty_registry_knows_nothing() {
        let registry = EventRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains("task_assigned_stream"));
        assert!(format!("{registry:?}").contains("EventRegistry"));
    }
}
