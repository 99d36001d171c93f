//! Stream transport contract: a durable, ordered, multi-consumer log.
//!
//! The transport is the only component that talks to the log itself. It knows nothing
//! about envelopes, handlers or retries; those live in the event bus built on top of it.
//!
//! # Consumer Groups
//!
//! A consumer group is a named cursor over one topic. Every entry appended to the topic
//! is handed to exactly one consumer of each group. Until that consumer acknowledges
//! it, the entry stays in the consumer's *pending* set and can be read again with
//! [`StreamTransport::read_pending`]; this is what makes crash recovery possible.
//!
//! ```text
//!   append ──► [ 1-0 | 2-0 | 3-0 | 4-0 ]   topic
//!                       ▲           ▲
//!                       │           └── group cursor (next read_new)
//!                       └── pending for consumer "host-42" until ack
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Name of the single field holding the serialized envelope.
pub const EVENT_DATA_FIELD: &str = "event_data";

/// Field map of a stream entry.
pub type FieldMap = BTreeMap<String, Vec<u8>>;

/// Transport-assigned, monotonically increasing entry identifier.
///
/// The format is transport specific (Redis uses `"<millis>-<seq>"`), so it is treated
/// as an opaque string everywhere outside the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(String);

impl EntryId {
    /// Create an entry id from the transport's representation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One immutable entry read from a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// Topic the entry was read from
    pub topic: String,
    /// Transport-assigned id
    pub id: EntryId,
    /// Raw field map, copied verbatim when dead-lettering
    pub fields: FieldMap,
}

impl StreamEntry {
    /// Build an entry carrying a serialized envelope in [`EVENT_DATA_FIELD`].
    #[must_use]
    pub fn with_event_data(topic: impl Into<String>, id: impl Into<EntryId>, data: Vec<u8>) -> Self {
        let mut fields = FieldMap::new();
        fields.insert(EVENT_DATA_FIELD.to_string(), data);
        Self {
            topic: topic.into(),
            id: id.into(),
            fields,
        }
    }

    /// The serialized envelope, if the entry has one.
    #[must_use]
    pub fn event_data(&self) -> Option<&[u8]> {
        self.fields.get(EVENT_DATA_FIELD).map(Vec::as_slice)
    }
}

/// Outcome of an idempotent consumer group creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupCreation {
    /// The group did not exist and was created
    Created,
    /// Another process (or an earlier run) already created it
    AlreadyExists,
}

/// Errors raised by a stream transport.
///
/// All of them are treated as transient by the event bus: the subscription loop logs
/// them and tries again on its next iteration.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Could not reach the log
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A command was rejected or failed
    #[error("{operation} failed on '{topic}': {reason}")]
    Command {
        /// Which operation failed (append, read, ack, ...)
        operation: &'static str,
        /// The topic involved
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The log replied with something the transport could not interpret
    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Shorthand for [`TransportError::Command`].
    #[must_use]
    pub fn command(operation: &'static str, topic: &str, reason: impl fmt::Display) -> Self {
        Self::Command {
            operation,
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Raw operations against a durable, ordered, multi-consumer log.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so implementations can be used behind
/// `Arc<dyn StreamTransport>`. Borrowed arguments must be copied before the returned
/// future is built; the future only borrows `self`.
///
/// # Thread Safety
///
/// Implementations are shared by every publisher and subscription loop, so they must
/// be `Send + Sync` and every method must be safe to call concurrently.
pub trait StreamTransport: Send + Sync + 'static {
    /// Append an entry to `topic`, creating the topic if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the log rejects the append.
    fn append(
        &self,
        topic: &str,
        fields: FieldMap,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, TransportError>> + Send + '_>>;

    /// Create `group` on `topic` (and the topic itself) if absent.
    ///
    /// New groups start at the beginning of the topic, so entries appended before the
    /// first subscription are still delivered.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on failures other than "already exists".
    fn create_group(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<GroupCreation, TransportError>> + Send + '_>>;

    /// Read entries already delivered to `consumer` but never acknowledged.
    ///
    /// Returns at most `count` entries with ids strictly greater than `after`
    /// (from the start of the pending set when `after` is `None`). Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the read fails.
    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&EntryId>,
        count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>>;

    /// Read up to `count` never-delivered entries for `group`, assigning them to
    /// `consumer`'s pending set.
    ///
    /// Waits up to `block` for entries to arrive; returns an empty batch on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the read fails.
    fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>>;

    /// Acknowledge an entry, removing it from the group's pending set.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the acknowledgement fails.
    fn ack(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}
