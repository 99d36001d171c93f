//! Integration tests for the Redis Streams transport and event bus using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. The tests are ignored by default; run them with
//! `cargo test -p outflow-redis -- --ignored`.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)] // Test code uses expect for clear failure messages

use outflow_core::event::{DomainEvent, EventEnvelope};
use outflow_core::event_bus::EventBus;
use outflow_core::handler::{HandlerError, typed_handler};
use outflow_core::stream::{EVENT_DATA_FIELD, FieldMap, GroupCreation, StreamTransport};
use outflow_redis::{RedisEventBusBuilder, RedisStreamTransport};
use outflow_runtime::BusConfig;
use outflow_testing::helpers::eventually;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskAssigned {
    task_id: String,
    user_id: String,
}

impl DomainEvent for TaskAssigned {
    const EVENT_TYPE: &'static str = "task_assigned_stream";
}

/// Start a Redis container and return its URL.
async fn setup_redis() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");
    (container, format!("redis://127.0.0.1:{port}"))
}

fn fast_config() -> BusConfig {
    BusConfig {
        block_timeout: Duration::from_millis(200),
        backoff_unit: Duration::from_millis(20),
        error_backoff: Duration::from_millis(50),
        ..BusConfig::default()
    }
}

fn event_fields(task_id: &str) -> FieldMap {
    let envelope = EventEnvelope::from_event(&TaskAssigned {
        task_id: task_id.to_string(),
        user_id: "U1".to_string(),
    })
    .unwrap();
    let mut fields = FieldMap::new();
    fields.insert(EVENT_DATA_FIELD.to_string(), envelope.to_bytes().unwrap());
    fields
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn group_creation_is_idempotent() {
    let (_container, url) = setup_redis().await;
    let transport = RedisStreamTransport::new(&url).await.expect("connect");

    assert_eq!(
        transport.create_group("orders", "billing").await.unwrap(),
        GroupCreation::Created
    );
    assert_eq!(
        transport.create_group("orders", "billing").await.unwrap(),
        GroupCreation::AlreadyExists
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacked_entries_come_back_as_pending() {
    let (_container, url) = setup_redis().await;
    let transport = RedisStreamTransport::new(&url).await.expect("connect");
    transport.create_group("orders", "billing").await.unwrap();

    let first = transport.append("orders", event_fields("T1")).await.unwrap();
    let second = transport.append("orders", event_fields("T2")).await.unwrap();

    let batch = transport
        .read_new("orders", "billing", "worker-1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch[0].event_data().is_some());

    transport.ack("orders", "billing", &first).await.unwrap();

    let pending = transport
        .read_pending("orders", "billing", "worker-1", None, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);

    let after = transport
        .read_pending("orders", "billing", "worker-1", Some(&second), 10)
        .await
        .unwrap();
    assert!(after.is_empty());

    // Other consumers do not see worker-1's pending entries
    let others = transport
        .read_pending("orders", "billing", "worker-2", None, 10)
        .await
        .unwrap();
    assert!(others.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn blocking_read_times_out_empty() {
    let (_container, url) = setup_redis().await;
    let transport = RedisStreamTransport::new(&url).await.expect("connect");
    transport.create_group("idle", "billing").await.unwrap();

    let batch = transport
        .read_new("idle", "billing", "worker-1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn read_without_group_fails() {
    let (_container, url) = setup_redis().await;
    let transport = RedisStreamTransport::new(&url).await.expect("connect");

    assert!(
        transport
            .read_new("missing", "billing", "worker-1", 10, Duration::ZERO)
            .await
            .is_err()
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn event_bus_round_trip() {
    let (_container, url) = setup_redis().await;
    let bus = RedisEventBusBuilder::new()
        .url(&url)
        .consumer_group("notifications")
        .consumer_name("it-1")
        .config(fast_config())
        .build()
        .await
        .expect("build bus");

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

    let envelope = EventEnvelope::from_event(&TaskAssigned {
        task_id: "T1".into(),
        user_id: "U1".into(),
    })
    .unwrap();
    bus.publish(TaskAssigned::EVENT_TYPE, &envelope).await.unwrap();

    assert!(eventually(WAIT, || received.lock().unwrap().len() == 1).await);
    assert_eq!(received.lock().unwrap()[0].task_id, "T1");

    bus.close().await;
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn failing_handler_dead_letters_to_dlq_topic() {
    let (_container, url) = setup_redis().await;
    let bus = RedisEventBusBuilder::new()
        .url(&url)
        .consumer_group("notifications")
        .consumer_name("it-1")
        .config(fast_config())
        .build()
        .await
        .expect("build bus");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    bus.subscribe(
        TaskAssigned::EVENT_TYPE,
        Arc::new(move |_envelope: EventEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::failed("smtp unavailable"))
            }
        }),
    )
    .await
    .unwrap();

    let transport = RedisStreamTransport::new(&url).await.expect("connect");
    let original = event_fields("T1");
    transport
        .append(TaskAssigned::EVENT_TYPE, original.clone())
        .await
        .unwrap();

    let dlq = format!("{}_dlq", TaskAssigned::EVENT_TYPE);
    transport.create_group(&dlq, "inspect").await.unwrap();

    let mut dead = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while dead.is_empty() && tokio::time::Instant::now() < deadline {
        dead = transport
            .read_new(&dlq, "inspect", "tester", 10, Duration::from_millis(200))
            .await
            .unwrap();
    }
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].fields, original);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    bus.close().await;
}
