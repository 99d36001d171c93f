//! In-memory outbox store with transactional writes.
//!
//! [`InMemoryOutboxStore::begin`] opens an [`InMemoryTransaction`] that stages both
//! aggregate writes and outbox rows. Nothing is visible until
//! [`commit`](InMemoryTransaction::commit); [`rollback`](InMemoryTransaction::rollback)
//! or dropping the transaction discards everything staged, mirroring a database
//! transaction.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use chrono::{DateTime, Utc};
use outflow_core::environment::{Clock, SystemClock};
use outflow_core::outbox::{OutboxCounts, OutboxError, OutboxEvent, OutboxStatus, OutboxStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Default retry ceiling, matching the Postgres store.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

#[derive(Debug, Default)]
struct Tables {
    rows: Vec<OutboxEvent>,
    aggregates: HashMap<String, serde_json::Value>,
}

/// Outbox store backed by a `Vec`, for fast deterministic tests.
///
/// Clones share the same rows.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
    max_retries: i32,
    fail_fetches: Arc<AtomicUsize>,
    fail_marks: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("rows", &self.len())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    /// Create an empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock: Arc::new(SystemClock),
            max_retries: DEFAULT_MAX_RETRIES,
            fail_fetches: Arc::new(AtomicUsize::new(0)),
            fail_marks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use `clock` for processed and abandoned timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Open a transaction.
    #[must_use]
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            rows: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    /// Make the next `n` calls to `get_unprocessed` fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `mark_processed` fail.
    pub fn fail_next_marks(&self, n: usize) {
        self.fail_marks.store(n, Ordering::SeqCst);
    }

    /// Snapshot of one row.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.tables.lock().unwrap().rows.iter().find(|r| r.id == id).cloned()
    }

    /// Snapshot of every committed row, in insertion order.
    #[must_use]
    pub fn rows(&self) -> Vec<OutboxEvent> {
        self.tables.lock().unwrap().rows.clone()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.lock().unwrap().rows.len()
    }

    /// Whether no row was committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A committed aggregate written through [`InMemoryTransaction::write_aggregate`].
    #[must_use]
    pub fn aggregate(&self, key: &str) -> Option<serde_json::Value> {
        self.tables.lock().unwrap().aggregates.get(key).cloned()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut OutboxEvent) -> T,
    ) -> Result<T, OutboxError> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        Ok(f(row))
    }
}

/// Open in-memory transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls it back.
#[derive(Debug)]
pub struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    rows: Vec<OutboxEvent>,
    aggregates: Vec<(String, serde_json::Value)>,
}

impl InMemoryTransaction {
    /// Stage a business write alongside the outbox rows.
    pub fn write_aggregate(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.aggregates.push((key.into(), value));
    }

    /// Number of staged outbox rows.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.rows.len()
    }

    /// Make every staged write visible.
    pub fn commit(mut self) {
        let mut tables = self.tables.lock().unwrap();
        tables.rows.append(&mut self.rows);
        tables.aggregates.extend(self.aggregates.drain(..));
    }

    /// Discard every staged write.
    pub fn rollback(self) {}
}

impl OutboxStore for InMemoryOutboxStore {
    type Transaction = InMemoryTransaction;

    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn create<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        event: &'a OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let duplicate = tx.rows.iter().any(|r| r.id == event.id)
                || self.tables.lock().unwrap().rows.iter().any(|r| r.id == event.id);
            if duplicate {
                return Err(OutboxError::Database(format!(
                    "duplicate key value violates unique constraint: {}",
                    event.id
                )));
            }
            tx.rows.push(event.clone());
            Ok(())
        })
    }

    fn get_unprocessed(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            if Self::take_failure(&self.fail_fetches) {
                return Err(OutboxError::Database("injected fetch failure".into()));
            }
            let tables = self.tables.lock().unwrap();
            let mut rows: Vec<OutboxEvent> = tables
                .rows
                .iter()
                .filter(|r| r.status() == OutboxStatus::Pending && r.retry_count < self.max_retries)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.created_at);
            rows.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(rows)
        })
    }

    fn mark_processed(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            if Self::take_failure(&self.fail_marks) {
                return Err(OutboxError::Database("injected mark failure".into()));
            }
            let now = self.clock.now();
            self.update(id, |row| {
                if row.processed_at.is_none() {
                    row.processed_at = Some(now);
                }
            })
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let ceiling = self.max_retries;
            self.update(id, |row| {
                row.retry_count += 1;
                row.last_error = Some(error.to_string());
                if row.retry_count >= ceiling && row.abandoned_at.is_none() {
                    row.abandoned_at = Some(now);
                }
                row.retry_count
            })
        })
    }

    fn mark_abandoned<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.update(id, |row| {
                row.abandoned_at = Some(now);
                row.last_error = Some(error.to_string());
            })
        })
    }

    fn abandon_exhausted(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut tables = self.tables.lock().unwrap();
            let mut moved = Vec::new();
            for row in &mut tables.rows {
                if row.status() == OutboxStatus::Pending && row.retry_count >= self.max_retries {
                    row.abandoned_at = Some(now);
                    moved.push(row.clone());
                }
            }
            Ok(moved)
        })
    }

    fn list_abandoned(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap();
            let mut rows: Vec<OutboxEvent> = tables
                .rows
                .iter()
                .filter(|r| r.status() == OutboxStatus::Abandoned)
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.created_at);
            rows.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(rows)
        })
    }

    fn requeue(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap();
            let row = tables
                .rows
                .iter_mut()
                .find(|r| r.id == id && r.processed_at.is_none())
                .ok_or(OutboxError::NotFound(id))?;
            row.abandoned_at = None;
            row.retry_count = 0;
            Ok(())
        })
    }

    fn purge_processed(
        &self,
        before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().unwrap();
            let before_len = tables.rows.len();
            tables
                .rows
                .retain(|r| !r.processed_at.is_some_and(|at| at < before));
            Ok((before_len - tables.rows.len()) as u64)
        })
    }

    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let tables = self.tables.lock().unwrap();
            let mut counts = OutboxCounts::default();
            for row in &tables.rows {
                match row.status() {
                    OutboxStatus::Pending => counts.pending += 1,
                    OutboxStatus::Processed => counts.processed += 1,
                    OutboxStatus::Abandoned => counts.abandoned += 1,
                }
            }
            Ok(counts)
        })
    }
}
