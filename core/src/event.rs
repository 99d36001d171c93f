//! Domain events and the envelope that carries them over the wire.
//!
//! Every stream entry holds exactly one [`EventEnvelope`], serialized as a JSON object
//! with stable field names:
//!
//! ```json
//! {
//!   "event_id": "5f0c7c1e-8d3a-4b5e-9d55-0a4f1c3e2b11",
//!   "event_type": "task_assigned_stream",
//!   "version": 1,
//!   "occurred_at": "2025-01-01T00:00:00Z",
//!   "payload": { "task_id": "T1", "user_id": "U1" }
//! }
//! ```
//!
//! `event_id` is the identity consumers deduplicate on. On the durable path it is the
//! outbox row id, so a redelivery after a crash carries the same id.
//!
//! # Example
//!
//! ```
//! use outflow_core::event::{DomainEvent, EventEnvelope};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct TaskDone {
//!     task_id: String,
//! }
//!
//! impl DomainEvent for TaskDone {
//!     const EVENT_TYPE: &'static str = "task_done_stream";
//!     const VERSION: u32 = 2;
//! }
//!
//! let envelope = EventEnvelope::from_event(&TaskDone { task_id: "T9".into() }).unwrap();
//! assert_eq!(envelope.event_type, "task_done_stream");
//! assert_eq!(envelope.version, 2);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event or envelope.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event or envelope.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// No decoder is registered for this event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The envelope carries a different event type than the one requested.
    #[error("Event type mismatch: expected '{expected}', got '{actual}'")]
    TypeMismatch {
        /// The event type the caller asked for
        expected: String,
        /// The event type found in the envelope
        actual: String,
    },

    /// The envelope was written by a newer schema than this process understands.
    #[error("Unsupported version {version} for event type '{event_type}' (max {supported})")]
    UnsupportedVersion {
        /// The event type
        event_type: String,
        /// Version found in the envelope
        version: u32,
        /// Highest version this process can decode
        supported: u32,
    },
}

/// A business fact that can travel through the outbox and the event bus.
///
/// `EVENT_TYPE` doubles as the topic name: an event of type `task_assigned_stream` is
/// published to the `task_assigned_stream` topic.
///
/// `VERSION` is the schema version written into new envelopes. Decoding accepts any
/// envelope whose version is not newer than `VERSION`, so additive schema changes
/// (new optional fields) only require bumping the constant.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type identifier, also used as the topic.
    const EVENT_TYPE: &'static str;

    /// Current schema version.
    const VERSION: u32 = 1;
}

/// The tagged envelope carried in every stream entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event identity, used by consumers for deduplication.
    pub event_id: Uuid,

    /// Event type (and topic) name.
    pub event_type: String,

    /// Schema version of `payload`.
    pub version: u32,

    /// When the business fact happened.
    pub occurred_at: DateTime<Utc>,

    /// The domain event as a JSON value.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Create an envelope with a fresh identity, stamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, version: u32, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            version,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Replace the event identity.
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Replace the occurrence timestamp.
    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Wrap a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be converted to JSON.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, EventError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;
        Ok(Self::new(E::EVENT_TYPE, E::VERSION, payload))
    }

    /// Decode the payload into a typed domain event.
    ///
    /// # Errors
    ///
    /// - [`EventError::TypeMismatch`] if the envelope holds another event type
    /// - [`EventError::UnsupportedVersion`] if the envelope is newer than `E::VERSION`
    /// - [`EventError::DeserializationError`] if the payload does not match `E`
    pub fn decode<E: DomainEvent>(&self) -> Result<E, EventError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EventError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }
        if self.version > E::VERSION {
            return Err(EventError::UnsupportedVersion {
                event_type: self.event_type.clone(),
                version: self.version,
                supported: E::VERSION,
            });
        }
        E::deserialize(&self.payload).map_err(|e| EventError::DeserializationError(e.to_string()))
    }

    /// Serialize the envelope to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Parse an envelope from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventEnvelope {{ id: {}, type: {}, version: {} }}",
            self.event_id, self.event_type, self.version
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TaskAssigned {
        task_id: String,
        user_id: String,
    }

    impl DomainEvent for TaskAssigned {
        const EVENT_TYPE: &'static str = "task_assigned_stream";
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TaskDone {
        task_id: String,
    }

    impl DomainEvent for TaskDone {
        const EVENT_TYPE: &'static str = "task_done_stream";
    }

    #[test]
    fn envelope_uses_stable_field_names() {
        let envelope = EventEnvelope::new("task_assigned_stream", 1, json!({"task_id": "T1"}));
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        let object = value.as_object().unwrap();
        for field in ["event_id", "event_type", "version", "occurred_at", "payload"] {
            assert!(object.contains_key(field), "missing field {field}");
        }
        assert_eq!(value["payload"]["task_id"], "T1");
    }

    #[test]
    fn decode_rejects_other_event_type() {
        let envelope = EventEnvelope::from_event(&TaskDone { task_id: "T1".into() }).unwrap();

        let err = envelope.decode::<TaskAssigned>().unwrap_err();
        assert_eq!(
            err,
            EventError::TypeMismatch {
                expected: "task_assigned_stream".into(),
                actual: "task_done_stream".into(),
            }
        );
    }

    #[test]
    fn decode_rejects_newer_version() {
        let envelope = EventEnvelope::new(
            "task_assigned_stream",
            2,
            json!({"task_id": "T1", "user_id": "U1"}),
        );

        assert!(matches!(
            envelope.decode::<TaskAssigned>(),
            Err(EventError::UnsupportedVersion { version: 2, supported: 1, .. })
        ));
    }

    #[test]
    fn decode_reports_payload_mismatch() {
        let envelope = EventEnvelope::new("task_assigned_stream", 1, json!({"task_id": 7}));

        assert!(matches!(
            envelope.decode::<TaskAssigned>(),
            Err(EventError::DeserializationError(_))
        ));
    }

    #[test]
    fn from_bytes_rejects_bare_payload() {
        // A raw domain payload without the envelope tags is not an envelope
        let bytes = br#"{"task_id":"T1","user_id":"U1"}"#;
        assert!(EventEnvelope::from_bytes(bytes).is_err());
    }

    #[test]
    fn display_shows_type_and_version() {
        let envelope = EventEnvelope::new("task_done_stream", 3, json!({}));
        let display = format!("{envelope}");
        assert!(display.contains("task_done_stream"));
        assert!(display.contains("version: 3"));
    }

    proptest! {
        #[test]
        fn wire_form_preserves_identity(task_id in "[a-zA-Z0-9-]{1,24}", user_id in "\\PC{0,16}") {
            let event = TaskAssigned { task_id, user_id };
            let envelope = EventEnvelope::from_event(&event).unwrap();
            let parsed = EventEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

            prop_assert_eq!(parsed.event_id, envelope.event_id);
            prop_assert_eq!(parsed.decode::<TaskAssigned>().unwrap(), event);
        }
    }
}
