//! Task notifications demo.
//!
//! Assigning a task writes the assignment and a `TaskAssigned` outbox row in one
//! transaction. The outbox processor relays the row to Redis Streams, where the
//! notification listener mails the assignee. Completions are published
//! fire-and-forget through the worker pool.
//!
//! # Running
//!
//! ```bash
//! docker run -d -p 5432:5432 -e POSTGRES_PASSWORD=postgres -e POSTGRES_DB=outflow postgres:16
//! docker run -d -p 6379:6379 redis:7
//! cargo run -p task-notifications
//! ```

mod assignments;
mod config;
mod events;
mod listener;

use crate::assignments::{Assignment, assign_task, ensure_schema};
use crate::config::Config;
use crate::events::{TaskAssigned, TaskDone, registry};
use crate::listener::{AssignmentNotifier, LogMailer};
use outflow_core::event::{DomainEvent, EventEnvelope};
use outflow_core::event_bus::EventBus;
use outflow_core::handler::{HandlerError, typed_handler};
use outflow_postgres::PostgresOutboxStore;
use outflow_redis::RedisEventBusBuilder;
use outflow_runtime::metrics::MetricsServer;
use outflow_runtime::{OutboxProcessor, RetryPolicy, WorkerPool, WorkerPoolError, retry_with_backoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_notifications=info,outflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        consumer_group = %config.consumer_group,
        metrics_addr = %config.metrics_addr,
        "Starting task notifications"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start()?;

    let shutdown = CancellationToken::new();

    // Postgres may still be starting when the service comes up
    let store = retry_with_backoff(RetryPolicy::linear(5, Duration::from_secs(1)), || {
        PostgresOutboxStore::new(&config.database_url)
    })
    .await?
    .with_max_retries(config.outflow.outbox.max_retries);
    store.migrate().await?;
    ensure_schema(store.pool()).await?;
    let store = Arc::new(store);

    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBusBuilder::new()
            .url(config.redis_url.clone())
            .consumer_group(config.consumer_group.clone())
            .config(config.outflow.bus.clone())
            .registry(registry())
            .cancellation(&shutdown)
            .build()
            .await?,
    );

    bus.subscribe(
        TaskAssigned::EVENT_TYPE,
        Arc::new(AssignmentNotifier::new(LogMailer)),
    )
    .await?;
    bus.subscribe(
        TaskDone::EVENT_TYPE,
        Arc::new(typed_handler(|event: TaskDone| async move {
            info!(task_id = %event.task_id, user_id = %event.user_id, "Task completed");
            Ok::<_, HandlerError>(())
        })),
    )
    .await?;

    let processor = OutboxProcessor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.outflow.outbox.clone(),
    )
    .spawn(shutdown.clone());
    let pool = WorkerPool::new(Arc::clone(&bus), &config.outflow.workers);

    let task_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    assign_task(
        &store,
        &Assignment {
            task_id,
            task_title: "Write the release notes".to_string(),
            user_id,
            user_email: "ada@example.com".to_string(),
            user_name: "Ada".to_string(),
        },
    )
    .await?;

    let done = EventEnvelope::from_event(&TaskDone {
        task_id: task_id.to_string(),
        user_id: user_id.to_string(),
    })?;
    match pool.publish_async(TaskDone::EVENT_TYPE, done) {
        Ok(()) => {}
        Err(WorkerPoolError::QueueFull { topic }) => {
            warn!(topic = %topic, "Publish queue full, completion event dropped");
        }
        Err(e) => return Err(e.into()),
    }

    info!("Running, press Ctrl+C to stop");
    shutdown_signal().await;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = processor.await {
        warn!(error = %e, "Outbox processor task ended abnormally");
    }
    if let Err(e) = pool.drain(DRAIN_TIMEOUT).await {
        warn!(error = %e, "Worker pool did not drain");
    }
    bus.close().await;

    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }
    info!("Stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
