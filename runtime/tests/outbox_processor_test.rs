//! Integration tests for the outbox processor
//!
//! Covers the end-to-end path (transactional insert, relay, stream delivery) and the
//! retry bookkeeping: failure counting, abandonment at the ceiling, requeue, and
//! republishing after a lost `mark_processed`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use outflow_core::event::{DomainEvent, EventEnvelope};
use outflow_core::event_bus::EventBus;
use outflow_core::handler::typed_handler;
use outflow_core::outbox::{OutboxEvent, OutboxStatus, OutboxStore};
use outflow_runtime::{BusConfig, OutboxConfig, OutboxProcessor, StreamEventBus, TickReport};
use outflow_testing::helpers::eventually;
use outflow_testing::{InMemoryOutboxStore, InMemoryStreamTransport, RecordingEventBus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Fixtures
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskAssigned {
    task_id: String,
    user_id: String,
}

impl DomainEvent for TaskAssigned {
    const EVENT_TYPE: &'static str = "task_assigned_stream";
}

fn config() -> OutboxConfig {
    OutboxConfig {
        poll_interval: Duration::from_millis(20),
        batch_size: 50,
        max_retries: 5,
    }
}

fn processor(store: &InMemoryOutboxStore, bus: Arc<dyn EventBus>) -> OutboxProcessor<InMemoryOutboxStore> {
    OutboxProcessor::new(Arc::new(store.clone()), bus, config())
}

/// Insert one committed row, the way a command handler would.
async fn assign(store: &InMemoryOutboxStore, task_id: &str) -> OutboxEvent {
    let event = TaskAssigned {
        task_id: task_id.to_string(),
        user_id: "U1".to_string(),
    };
    let row = OutboxEvent::from_event("task", task_id, &event).unwrap();

    let mut tx = store.begin();
    tx.write_aggregate(format!("task:{task_id}"), json!({ "assignee": "U1" }));
    store.create(&mut tx, &row).await.unwrap();
    tx.commit();
    row
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn committed_row_reaches_subscriber() {
    let store = InMemoryOutboxStore::new();
    let transport = InMemoryStreamTransport::new();
    let bus = Arc::new(
        StreamEventBus::new(Arc::new(transport.clone()), "notifications").with_config(BusConfig {
            block_timeout: Duration::from_millis(50),
            ..BusConfig::default()
        }),
    );

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bus.subscribe(
        TaskAssigned::EVENT_TYPE,
        Arc::new(typed_handler(move |event: TaskAssigned| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        })),
    )
    .await
    .unwrap();

    let row = assign(&store, "T1").await;
    let relay = processor(&store, bus.clone());
    let report = relay.tick().await;

    assert_eq!(
        report,
        TickReport {
            fetched: 1,
            published: 1,
            failed: 0,
            abandoned: 0,
        }
    );
    assert!(store.get_unprocessed(10).await.unwrap().is_empty());
    assert_eq!(store.get(row.id).unwrap().status(), OutboxStatus::Processed);

    assert!(eventually(WAIT, || received.lock().unwrap().len() == 1).await);
    assert_eq!(
        received.lock().unwrap()[0],
        TaskAssigned {
            task_id: "T1".into(),
            user_id: "U1".into()
        }
    );

    // The stream entry carries the row id as event id
    let envelopes: Vec<EventEnvelope> = transport.envelopes(TaskAssigned::EVENT_TYPE);
    assert_eq!(envelopes[0].event_id, row.id);

    bus.close().await;
}

#[tokio::test]
async fn rolled_back_transaction_publishes_nothing() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();

    let row = OutboxEvent::new("task", "T1", "task_assigned_stream", json!({}));
    let mut tx = store.begin();
    tx.write_aggregate("task:T1", json!({ "assignee": "U1" }));
    store.create(&mut tx, &row).await.unwrap();
    tx.rollback();

    assert!(store.is_empty());
    assert!(store.aggregate("task:T1").is_none());

    let report = processor(&store, Arc::new(bus.clone())).tick().await;
    assert_eq!(report, TickReport::default());
    assert_eq!(bus.attempts(), 0);
}

#[tokio::test]
async fn rows_published_oldest_first_to_their_event_type() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    for task in ["T1", "T2", "T3"] {
        assign(&store, task).await;
    }
    let done = OutboxEvent::new("task", "T1", "task_done_stream", json!({ "task_id": "T1" }));
    let mut tx = store.begin();
    store.create(&mut tx, &done).await.unwrap();
    tx.commit();

    let report = processor(&store, Arc::new(bus.clone())).tick().await;

    assert_eq!(report.published, 4);
    let assigned: Vec<_> = bus
        .published_to("task_assigned_stream")
        .iter()
        .map(|e| e.payload["task_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(assigned, vec!["T1", "T2", "T3"]);
    assert_eq!(bus.published_to("task_done_stream").len(), 1);
}

// ============================================================================
// Failures and retry bookkeeping
// ============================================================================

#[tokio::test]
async fn failed_publish_is_counted_and_retried_next_tick() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    let row = assign(&store, "T1").await;
    let relay = processor(&store, Arc::new(bus.clone()));

    bus.fail_next(1);
    let first = relay.tick().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.published, 0);

    let stored = store.get(row.id).unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.as_ref().unwrap().contains("injected"));
    assert_eq!(stored.status(), OutboxStatus::Pending);

    let second = relay.tick().await;
    assert_eq!(second.published, 1);
    assert_eq!(store.get(row.id).unwrap().status(), OutboxStatus::Processed);
}

#[tokio::test]
async fn row_abandoned_when_retry_ceiling_reached() {
    let store = InMemoryOutboxStore::new().with_max_retries(3);
    let bus = RecordingEventBus::new();
    bus.fail_topic("task_assigned_stream");
    let row = assign(&store, "T1").await;
    let relay = processor(&store, Arc::new(bus.clone()));

    assert_eq!(relay.tick().await.abandoned, 0);
    assert_eq!(relay.tick().await.abandoned, 0);
    let third = relay.tick().await;
    assert_eq!(third.failed, 1);
    assert_eq!(third.abandoned, 1);

    let stored = store.get(row.id).unwrap();
    assert_eq!(stored.status(), OutboxStatus::Abandoned);
    assert_eq!(stored.retry_count, 3);
    assert!(stored.abandoned_at.is_some());

    // Abandoned rows are no longer fetched
    assert_eq!(relay.tick().await, TickReport::default());
    assert_eq!(bus.attempts(), 3);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.abandoned, 1);
    assert_eq!(counts.pending, 0);
    assert_eq!(store.list_abandoned(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_row_left_pending_is_abandoned_on_next_tick() {
    let store = InMemoryOutboxStore::new().with_max_retries(5);
    let bus = RecordingEventBus::new();
    let row = assign(&store, "T1").await;

    // Failures recorded under a higher ceiling, then the service restarts with a lower one
    for _ in 0..3 {
        store.mark_failed(row.id, "broker down").await.unwrap();
    }
    let lowered = store.clone().with_max_retries(3);
    let relay = processor(&lowered, Arc::new(bus.clone()));

    let report = relay.tick().await;
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.fetched, 0);
    assert_eq!(bus.attempts(), 0);

    assert_eq!(store.get(row.id).unwrap().status(), OutboxStatus::Abandoned);
    let counts = store.counts().await.unwrap();
    assert_eq!((counts.pending, counts.abandoned), (0, 1));
    assert_eq!(store.list_abandoned(10).await.unwrap().len(), 1);

    // Reported once
    assert_eq!(relay.tick().await, TickReport::default());
}

#[tokio::test]
async fn requeued_row_is_published_again() {
    let store = InMemoryOutboxStore::new().with_max_retries(1);
    let bus = RecordingEventBus::new();
    bus.fail_topic("task_assigned_stream");
    let row = assign(&store, "T1").await;
    let relay = processor(&store, Arc::new(bus.clone()));

    assert_eq!(relay.tick().await.abandoned, 1);

    bus.heal_topic("task_assigned_stream");
    store.requeue(row.id).await.unwrap();
    assert_eq!(store.get(row.id).unwrap().retry_count, 0);

    assert_eq!(relay.tick().await.published, 1);
    assert_eq!(store.get(row.id).unwrap().status(), OutboxStatus::Processed);
}

#[tokio::test]
async fn lost_mark_processed_republishes_same_event_id() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    let row = assign(&store, "T1").await;
    let relay = processor(&store, Arc::new(bus.clone()));

    store.fail_next_marks(1);
    let first = relay.tick().await;
    assert_eq!(first.fetched, 1);
    assert_eq!(first.published, 0);
    assert_eq!(first.failed, 0);
    assert_eq!(store.get(row.id).unwrap().retry_count, 0);

    assert_eq!(relay.tick().await.published, 1);

    let published = bus.published_to("task_assigned_stream");
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].event_id, row.id);
    assert_eq!(published[1].event_id, row.id);
}

#[tokio::test]
async fn fetch_failure_yields_empty_tick() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    assign(&store, "T1").await;
    let relay = processor(&store, Arc::new(bus.clone()));

    store.fail_next_fetches(1);
    assert_eq!(relay.tick().await, TickReport::default());
    assert_eq!(bus.attempts(), 0);

    assert_eq!(relay.tick().await.published, 1);
}

#[tokio::test]
async fn batch_size_limits_rows_per_tick() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    for n in 0..5 {
        assign(&store, &format!("T{n}")).await;
    }
    let relay = OutboxProcessor::new(
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        OutboxConfig {
            batch_size: 2,
            ..config()
        },
    );

    assert_eq!(relay.tick().await.published, 2);
    assert_eq!(relay.tick().await.published, 2);
    assert_eq!(relay.tick().await.published, 1);
    assert_eq!(relay.tick().await.fetched, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn spawned_processor_relays_until_cancelled() {
    let store = InMemoryOutboxStore::new();
    let bus = RecordingEventBus::new();
    let shutdown = CancellationToken::new();
    let handle = processor(&store, Arc::new(bus.clone())).spawn(shutdown.clone());

    assign(&store, "T1").await;
    assert!(eventually(WAIT, || bus.published_to("task_assigned_stream").len() == 1).await);

    shutdown.cancel();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    // Nothing relays after the loop stopped
    assign(&store, "T2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.published_to("task_assigned_stream").len(), 1);
}
