//! `PostgreSQL` outbox store for outflow.
//!
//! [`PostgresOutboxStore`] implements [`OutboxStore`] over an `outbox_events` table.
//! Producers write the outbox row in the same transaction as their business mutation:
//!
//! ```ignore
//! use outflow_core::outbox::{OutboxEvent, OutboxStore};
//! use outflow_postgres::PostgresOutboxStore;
//!
//! let store = PostgresOutboxStore::new("postgres://localhost/app").await?;
//! store.migrate().await?;
//!
//! let mut tx = store.begin().await?;
//! sqlx::query("UPDATE tasks SET assignee = $1 WHERE id = $2")
//!     .bind(user_id)
//!     .bind(task_id)
//!     .execute(&mut *tx)
//!     .await?;
//! store.create(&mut tx, &OutboxEvent::from_event("task", task_id, &event)?).await?;
//! tx.commit().await?;
//! ```
//!
//! The row becomes visible to the processor only when the transaction commits, and
//! disappears with it on rollback.

use chrono::{DateTime, Utc};
use outflow_core::outbox::{OutboxCounts, OutboxError, OutboxEvent, OutboxStore};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Default retry ceiling.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

const SELECT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, version, payload, \
     created_at, processed_at, retry_count, last_error, abandoned_at";

fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> OutboxError + '_ {
    move |e| OutboxError::Database(format!("{context}: {e}"))
}

/// Outbox store backed by a `PostgreSQL` connection pool.
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    max_retries: i32,
}

impl PostgresOutboxStore {
    /// Connect to `database_url` with a pool of 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error("Failed to connect"))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Override the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The underlying pool, for business queries sharing the database.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction to pass to [`OutboxStore::create`].
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxError> {
        self.pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))
    }

    /// Create the `outbox_events` table and its indexes.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), OutboxError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(format!("Migration failed: {e}")))
    }

    fn row_to_event(row: &PgRow) -> Result<OutboxEvent, sqlx::Error> {
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            abandoned_at: row.try_get("abandoned_at")?,
        })
    }

    fn rows_to_events(rows: &[PgRow]) -> Result<Vec<OutboxEvent>, OutboxError> {
        rows.iter()
            .map(Self::row_to_event)
            .collect::<Result<_, _>>()
            .map_err(db_error("Failed to decode outbox row"))
    }

    async fn exists(&self, id: Uuid) -> Result<bool, OutboxError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM outbox_events WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("Failed to look up outbox event"))?;
        Ok(exists)
    }
}

impl OutboxStore for PostgresOutboxStore {
    type Transaction = Transaction<'static, Postgres>;

    fn max_retries(&self) -> i32 {
        self.max_retries
    }

    fn create<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        event: &'a OutboxEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO outbox_events (
                    id, aggregate_type, aggregate_id, event_type, version, payload,
                    created_at, retry_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
                ",
            )
            .bind(event.id)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.event_type)
            .bind(event.version)
            .bind(&event.payload)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await
            .map_err(db_error("Failed to insert outbox event"))?;

            tracing::debug!(
                event_id = %event.id,
                aggregate_type = %event.aggregate_type,
                aggregate_id = %event.aggregate_id,
                event_type = %event.event_type,
                "Outbox event staged"
            );
            metrics::counter!("outbox_events_staged_total", "event_type" => event.event_type.clone())
                .increment(1);
            Ok(())
        })
    }

    fn get_unprocessed(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS}
                 FROM outbox_events
                 WHERE processed_at IS NULL AND abandoned_at IS NULL AND retry_count < $1
                 ORDER BY created_at ASC
                 LIMIT $2"
            );
            let rows = sqlx::query(&query)
                .bind(self.max_retries)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to fetch unprocessed outbox events"))?;
            Self::rows_to_events(&rows)
        })
    }

    fn mark_processed(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE outbox_events SET processed_at = now() WHERE id = $1 AND processed_at IS NULL",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to mark outbox event processed"))?;

            if result.rows_affected() == 0 && !self.exists(id).await? {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i32, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let retry_count: Option<(i32,)> = sqlx::query_as(
                r"
                UPDATE outbox_events
                SET retry_count = retry_count + 1,
                    last_error = $2,
                    abandoned_at = CASE
                        WHEN retry_count + 1 >= $3 THEN COALESCE(abandoned_at, now())
                        ELSE abandoned_at
                    END
                WHERE id = $1
                RETURNING retry_count
                ",
            )
            .bind(id)
            .bind(error)
            .bind(self.max_retries)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to mark outbox event failed"))?;

            retry_count
                .map(|(count,)| count)
                .ok_or(OutboxError::NotFound(id))
        })
    }

    fn mark_abandoned<'a>(
        &'a self,
        id: Uuid,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE outbox_events SET abandoned_at = now(), last_error = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to mark outbox event abandoned"))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn abandon_exhausted(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let query = format!(
                "UPDATE outbox_events
                 SET abandoned_at = now()
                 WHERE processed_at IS NULL AND abandoned_at IS NULL AND retry_count >= $1
                 RETURNING {SELECT_COLUMNS}"
            );
            let rows = sqlx::query(&query)
                .bind(self.max_retries)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to abandon exhausted outbox events"))?;
            Self::rows_to_events(&rows)
        })
    }

    fn list_abandoned(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEvent>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {SELECT_COLUMNS}
                 FROM outbox_events
                 WHERE abandoned_at IS NOT NULL AND processed_at IS NULL
                 ORDER BY created_at ASC
                 LIMIT $1"
            );
            let rows = sqlx::query(&query)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to list abandoned outbox events"))?;
            Self::rows_to_events(&rows)
        })
    }

    fn requeue(&self, id: Uuid)
    -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_events
                SET abandoned_at = NULL, retry_count = 0
                WHERE id = $1 AND processed_at IS NULL
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to requeue outbox event"))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            tracing::info!(event_id = %id, "Outbox event requeued");
            Ok(())
        })
    }

    fn purge_processed(
        &self,
        before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM outbox_events WHERE processed_at IS NOT NULL AND processed_at < $1",
            )
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to purge processed outbox events"))?;

            let purged = result.rows_affected();
            if purged > 0 {
                tracing::info!(purged, before = %before, "Purged processed outbox events");
            }
            Ok(purged)
        })
    }

    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let (pending, processed, abandoned): (i64, i64, i64) = sqlx::query_as(
                r"
                SELECT
                    COUNT(*) FILTER (WHERE processed_at IS NULL AND abandoned_at IS NULL),
                    COUNT(*) FILTER (WHERE processed_at IS NOT NULL),
                    COUNT(*) FILTER (WHERE processed_at IS NULL AND abandoned_at IS NOT NULL)
                FROM outbox_events
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count outbox events"))?;

            Ok(OutboxCounts {
                pending,
                processed,
                abandoned,
            })
        })
    }
}
