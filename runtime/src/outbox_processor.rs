//! Periodic relay from the outbox table to the event bus.
//!
//! Every `poll_interval` the processor fetches the oldest pending rows, publishes each
//! one to the topic named by its event type, and records the outcome:
//!
//! - publish ok → `mark_processed`
//! - publish failed → `mark_failed`; the next tick retries the row
//! - retry count reached the ceiling → the store abandons the row inside `mark_failed`;
//!   logged at `error` and counted in `outbox_events_abandoned_total`
//!
//! Each tick starts with `abandon_exhausted`, which moves rows left at the ceiling
//! without an abandoned mark (for instance after the ceiling was lowered).
//!
//! A crash between a successful publish and `mark_processed` republishes the row on the
//! next tick with the same `event_id`. Delivery is at-least-once.

use crate::config::OutboxConfig;
use crate::metrics::OutboxMetrics;
use outflow_core::event_bus::EventBus;
use outflow_core::outbox::{OutboxEvent, OutboxStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outcome counts of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rows fetched
    pub fetched: usize,
    /// Rows published and marked processed
    pub published: usize,
    /// Rows whose publish failed (including those abandoned)
    pub failed: usize,
    /// Rows moved to the abandoned state
    pub abandoned: usize,
}

/// Polls an [`OutboxStore`] and republishes rows through an [`EventBus`].
pub struct OutboxProcessor<S: OutboxStore> {
    store: Arc<S>,
    bus: Arc<dyn EventBus>,
    config: OutboxConfig,
}

impl<S: OutboxStore + 'static> OutboxProcessor<S> {
    /// Create a processor.
    #[must_use]
    pub const fn new(store: Arc<S>, bus: Arc<dyn EventBus>, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    /// The outbox store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Polling settings.
    #[must_use]
    pub const fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Run one poll: fetch a batch and publish every row.
    ///
    /// Store and bus errors are logged and reflected in the report; they never abort
    /// the tick.
    pub async fn tick(&self) -> TickReport {
        let start = Instant::now();
        let mut report = TickReport::default();

        match self.store.abandon_exhausted().await {
            Ok(rows) => {
                for row in &rows {
                    report.abandoned += 1;
                    Self::alert_abandoned(row, row.retry_count, row.last_error.as_deref().unwrap_or(""));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to abandon exhausted outbox events");
            }
        }

        let rows = match self.store.get_unprocessed(self.config.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch unprocessed outbox events");
                return report;
            }
        };
        report.fetched = rows.len();

        for row in &rows {
            self.relay(row, &mut report).await;
        }

        OutboxMetrics::record_tick(start.elapsed());
        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                abandoned = report.abandoned,
                "Outbox tick complete"
            );
        }
        report
    }

    async fn relay(&self, row: &OutboxEvent, report: &mut TickReport) {
        let envelope = row.to_envelope();

        match self.bus.publish(&row.event_type, &envelope).await {
            Ok(entry_id) => match self.store.mark_processed(row.id).await {
                Ok(()) => {
                    report.published += 1;
                    OutboxMetrics::record_published();
                    tracing::debug!(event_id = %row.id, topic = %row.event_type, entry_id = %entry_id, "Outbox event published");
                }
                Err(e) => {
                    // The row stays pending and is republished next tick
                    tracing::error!(event_id = %row.id, error = %e, "Published outbox event but failed to mark it processed");
                }
            },
            Err(publish_err) => {
                report.failed += 1;
                OutboxMetrics::record_failed();
                self.record_failure(row, &publish_err.to_string(), report).await;
            }
        }
    }

    async fn record_failure(&self, row: &OutboxEvent, error: &str, report: &mut TickReport) {
        let retry_count = match self.store.mark_failed(row.id, error).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(event_id = %row.id, error = %e, "Failed to record outbox publish failure");
                return;
            }
        };

        let ceiling = self.store.max_retries();
        if retry_count < ceiling {
            tracing::warn!(
                event_id = %row.id,
                topic = %row.event_type,
                retry_count,
                error = %error,
                "Failed to publish outbox event, will retry"
            );
            return;
        }

        // mark_failed abandoned the row in the same write
        report.abandoned += 1;
        Self::alert_abandoned(row, retry_count, error);
    }

    fn alert_abandoned(row: &OutboxEvent, retry_count: i32, error: &str) {
        OutboxMetrics::record_abandoned();
        tracing::error!(
            event_id = %row.id,
            aggregate_type = %row.aggregate_type,
            aggregate_id = %row.aggregate_id,
            topic = %row.event_type,
            retry_count,
            error = %error,
            "Outbox event abandoned after max retries"
        );
    }

    /// Tick every `poll_interval` until `cancel` fires.
    ///
    /// The first tick runs immediately. Ticks missed while a slow tick was running are
    /// skipped, not replayed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_retries = self.store.max_retries(),
            "Outbox processor started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::info!("Outbox processor stopped");
    }

    /// Run on a background task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
