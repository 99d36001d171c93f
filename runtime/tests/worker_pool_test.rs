//! Integration tests for the publish worker pool
//!
//! Uses `RecordingEventBus` paused and released by the test to hold workers inside a
//! publish, which makes queue occupancy deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use outflow_core::event::EventEnvelope;
use outflow_core::event_bus::EventBus;
use outflow_runtime::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
use outflow_testing::RecordingEventBus;
use outflow_testing::helpers::eventually;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

const TOPIC: &str = "task_done_stream";
const WAIT: Duration = Duration::from_secs(5);

fn pool(bus: &RecordingEventBus, workers: usize, queue_capacity: usize) -> WorkerPool {
    let bus: Arc<dyn EventBus> = Arc::new(bus.clone());
    WorkerPool::new(
        bus,
        &WorkerPoolConfig {
            workers,
            queue_capacity,
        },
    )
}

fn done(n: usize) -> EventEnvelope {
    EventEnvelope::new(TOPIC, 1, json!({ "task_id": format!("T{n}") }))
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn accepted_jobs_are_published() {
    let bus = RecordingEventBus::new();
    let pool = pool(&bus, 3, 100);

    for n in 0..10 {
        pool.publish_async(TOPIC, done(n)).unwrap();
    }

    assert!(eventually(WAIT, || bus.published_to(TOPIC).len() == 10).await);
    assert_eq!(pool.shutdown().await, 0);
}

#[tokio::test]
async fn publish_failure_discards_job_and_keeps_worker() {
    let bus = RecordingEventBus::new();
    bus.fail_next(1);
    let pool = pool(&bus, 1, 10);

    pool.publish_async(TOPIC, done(1)).unwrap();
    pool.publish_async(TOPIC, done(2)).unwrap();

    assert!(eventually(WAIT, || bus.published_to(TOPIC).len() == 1).await);
    assert_eq!(bus.attempts(), 2);
    assert_eq!(bus.published_to(TOPIC)[0].payload["task_id"], "T2");

    pool.shutdown().await;
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn full_queue_rejects_without_blocking() {
    let bus = RecordingEventBus::new();
    bus.pause();
    let pool = pool(&bus, 1, 2);

    // The single worker takes the first job and blocks inside publish
    pool.publish_async(TOPIC, done(0)).unwrap();
    assert!(eventually(WAIT, || bus.attempts() == 1).await);

    pool.publish_async(TOPIC, done(1)).unwrap();
    pool.publish_async(TOPIC, done(2)).unwrap();
    assert_eq!(pool.queued(), 2);

    let rejected = tokio::time::timeout(Duration::from_millis(100), async {
        pool.publish_async(TOPIC, done(3))
    })
    .await
    .expect("publish_async must not wait");
    assert_eq!(
        rejected,
        Err(WorkerPoolError::QueueFull {
            topic: TOPIC.to_string()
        })
    );

    bus.resume();
    assert!(eventually(WAIT, || bus.published_to(TOPIC).len() == 3).await);
    pool.shutdown().await;
}

#[tokio::test]
async fn capacity_and_workers_are_at_least_one() {
    let bus = RecordingEventBus::new();
    let pool = pool(&bus, 0, 0);
    assert_eq!(pool.capacity(), 1);

    pool.publish_async(TOPIC, done(0)).unwrap();
    assert!(eventually(WAIT, || bus.published_to(TOPIC).len() == 1).await);
    pool.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_finishes_in_flight_and_abandons_queued() {
    let bus = RecordingEventBus::new();
    bus.pause();
    let pool = Arc::new(pool(&bus, 1, 10));

    pool.publish_async(TOPIC, done(0)).unwrap();
    assert!(eventually(WAIT, || bus.attempts() == 1).await);
    pool.publish_async(TOPIC, done(1)).unwrap();
    pool.publish_async(TOPIC, done(2)).unwrap();

    let stopping = Arc::clone(&pool);
    let shutdown = tokio::spawn(async move { stopping.shutdown().await });

    assert!(eventually(WAIT, || !pool.is_accepting()).await);
    assert_eq!(
        pool.publish_async(TOPIC, done(3)),
        Err(WorkerPoolError::ShuttingDown)
    );

    bus.resume();
    let abandoned = shutdown.await.unwrap();

    assert_eq!(abandoned, 2);
    assert_eq!(bus.published_to(TOPIC).len(), 1);
    assert_eq!(bus.attempts(), 1);
}

#[tokio::test]
async fn drain_dispatches_every_queued_job() {
    let bus = RecordingEventBus::new().with_delay(Duration::from_millis(5));
    let pool = pool(&bus, 2, 100);

    for n in 0..20 {
        pool.publish_async(TOPIC, done(n)).unwrap();
    }

    pool.drain(WAIT).await.unwrap();

    assert_eq!(bus.published_to(TOPIC).len(), 20);
    assert!(!pool.is_accepting());
    assert_eq!(
        pool.publish_async(TOPIC, done(99)),
        Err(WorkerPoolError::ShuttingDown)
    );
}

#[tokio::test]
async fn drain_timeout_reports_remaining_jobs() {
    let bus = RecordingEventBus::new();
    bus.pause();
    let pool = pool(&bus, 1, 10);

    pool.publish_async(TOPIC, done(0)).unwrap();
    assert!(eventually(WAIT, || bus.attempts() == 1).await);
    pool.publish_async(TOPIC, done(1)).unwrap();
    pool.publish_async(TOPIC, done(2)).unwrap();

    // Release the in-flight publish after the deadline has passed
    let releaser = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        releaser.resume();
    });

    let result = pool.drain(Duration::from_millis(50)).await;

    assert_eq!(result, Err(WorkerPoolError::DrainTimeout { remaining: 2 }));
    assert_eq!(bus.published_to(TOPIC).len(), 1);
}

#[tokio::test]
async fn drain_timeout_after_idle_workers_exited() {
    let bus = RecordingEventBus::new();
    bus.pause();
    let pool = pool(&bus, 2, 10);

    // One worker held inside publish; the other sees an empty, closed queue and exits
    pool.publish_async(TOPIC, done(0)).unwrap();
    assert!(eventually(WAIT, || bus.attempts() == 1).await);

    let releaser = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        releaser.resume();
    });

    let result = pool.drain(Duration::from_millis(50)).await;

    assert_eq!(result, Err(WorkerPoolError::DrainTimeout { remaining: 0 }));
    assert_eq!(bus.published_to(TOPIC).len(), 1);
}

#[tokio::test]
async fn shutdown_of_idle_pool_returns_zero() {
    let bus = RecordingEventBus::new();
    let pool = pool(&bus, 4, 10);

    assert_eq!(pool.shutdown().await, 0);
    assert!(!pool.is_accepting());
    assert_eq!(pool.queued(), 0);
}
