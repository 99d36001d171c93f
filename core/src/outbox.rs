//! Transactional outbox contract.
//!
//! A producer writes an [`OutboxEvent`] with [`OutboxStore::create`] using the same
//! transaction as its business mutation. The event is therefore durable if and only if
//! the business fact is durable. A processor later polls
//! [`OutboxStore::get_unprocessed`], publishes each row and records the outcome.
//!
//! # Row lifecycle
//!
//! ```text
//! created ──publish ok──► processed
//!    │
//!    └─publish failed──► retry_count += 1 ──(count == ceiling)──► abandoned
//!                                                                    │
//!                          pending ◄───────────── requeue (operator) ─┘
//! ```

use crate::event::{DomainEvent, EventEnvelope, EventError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by an outbox store.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// No outbox row with this id
    #[error("Outbox event not found: {0}")]
    NotFound(Uuid),

    /// Failed to encode or decode a payload
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<EventError> for OutboxError {
    fn from(err: EventError) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Processing state derived from an outbox row's timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Waiting to be published
    Pending,
    /// Published successfully
    Processed,
    /// Gave up after reaching the retry ceiling
    Abandoned,
}

/// One durable record of event intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Row identity; also the `event_id` of the published envelope.
    pub id: Uuid,
    /// Kind of aggregate the event describes (`"task"`).
    pub aggregate_type: String,
    /// Identity of that aggregate.
    pub aggregate_id: String,
    /// Event type, also the topic it is published to.
    pub event_type: String,
    /// Schema version of `payload`.
    pub version: i32,
    /// Event payload.
    pub payload: serde_json::Value,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was published; never reprocessed once set.
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retry_count: i32,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the processor gave up on the row.
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Create a pending row with schema version 1.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            version: 1,
            payload,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_error: None,
            abandoned_at: None,
        }
    }

    /// Create a pending row from a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Serialization`] if the event cannot be converted to JSON.
    pub fn from_event<E: DomainEvent>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event: &E,
    ) -> Result<Self, OutboxError> {
        let payload =
            serde_json::to_value(event).map_err(|e| OutboxError::Serialization(e.to_string()))?;
        let mut row = Self::new(aggregate_type, aggregate_id, E::EVENT_TYPE, payload);
        row.version = i32::try_from(E::VERSION).unwrap_or(i32::MAX);
        Ok(row)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> OutboxStatus {
        if self.processed_at.is_some() {
            OutboxStatus::Processed
        } else if self.abandoned_at.is_some() {
            OutboxStatus::Abandoned
        } else {
            OutboxStatus::Pending
        }
    }

    /// Envelope published for this row.
    ///
    /// The envelope reuses the row id and creation time, so every redelivery of the
    /// same row carries the same `event_id`.
    #[must_use]
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_type.clone(),
            u32::try_from(self.version).unwrap_or(1),
            self.payload.clone(),
        )
        .with_event_id(self.id)
        .with_occurred_at(self.created_at)
    }
}

/// Row counts per lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// Rows waiting to be published
    pub pending: i64,
    /// Rows published
    pub processed: i64,
    /// Rows given up on
    pub abandoned: i64,
}

/// Durable storage for outbox rows.
///
/// `Transaction` is the backend's handle for an open transaction
/// (`sqlx::Transaction<'static, Postgres>` for Postgres). Producers begin it, write
/// their aggregate, call [`create`](OutboxStore::create) and commit.
pub trait OutboxStore: Send + Sync {
    /// Open transaction type of the backend.
    type Transaction: Send;

    /// Retry ceiling: rows with `retry_count >= max_retries` are never fetched.
    fn max_retries(&self) -> i32;

    /// Insert `event` inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the insert fails.
    fn create<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        event: &'a OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;

    /// Oldest pending rows (by `created_at`) below the retry ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn get_unprocessed(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>>;

    /// Set `processed_at`. A row that is already processed is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no row has this id.
    fn mark_processed(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Increment `retry_count` and record `error`. Returns the new retry count.
    ///
    /// A row whose new count reaches [`max_retries`](OutboxStore::max_retries) is
    /// abandoned in the same write, so no crash can leave it exhausted but pending.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no row has this id.
    fn mark_failed<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, OutboxError>> + Send + 'a>>;

    /// Move the row to the terminal abandoned state.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no row has this id.
    fn mark_abandoned<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;

    /// Abandon every unprocessed row already at or over the retry ceiling, and return
    /// those rows.
    ///
    /// Catches rows exhausted under an older, higher ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the update fails.
    fn abandon_exhausted(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>>;

    /// Oldest abandoned rows first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn list_abandoned(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>>;

    /// Clear the abandoned state and reset the retry count of an unprocessed row.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no unprocessed row has this id.
    fn requeue(&self, id: Uuid)
    -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Delete processed rows whose `processed_at` is before `before`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the delete fails.
    fn purge_processed(
        &self,
        before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;

    /// Row counts per state.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts, OutboxError>> + Send + '_>>;
}
