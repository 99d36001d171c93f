//! Bounded pool of publish workers for fire-and-forget events.
//!
//! Producers hand a [`PublishJob`] to [`WorkerPool::publish_async`], which never waits:
//! it either enqueues the job or reports [`WorkerPoolError::QueueFull`]. A fixed number
//! of workers pull jobs from the shared queue and call [`EventBus::publish`].
//!
//! Jobs are not persisted. A job still queued when the process dies is lost, so events
//! whose loss is unacceptable must go through the outbox instead.
//!
//! # Stopping
//!
//! - [`shutdown`](WorkerPool::shutdown) stops intake, lets in-flight publishes finish
//!   and abandons queued jobs.
//! - [`drain`](WorkerPool::drain) stops intake and dispatches every queued job before
//!   stopping, within a deadline.

use crate::config::WorkerPoolConfig;
use crate::metrics::WorkerPoolMetrics;
use futures::future::join_all;
use outflow_core::event::EventEnvelope;
use outflow_core::event_bus::EventBus;
use std::pin::pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One queued publish.
#[derive(Debug, Clone)]
pub struct PublishJob {
    /// Destination topic
    pub topic: String,
    /// Envelope to publish
    pub envelope: EventEnvelope,
}

/// Errors returned by the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerPoolError {
    /// The queue is at capacity; the job was not accepted
    #[error("Worker pool queue is full, rejected event for topic '{topic}'")]
    QueueFull {
        /// Topic of the rejected job
        topic: String,
    },

    /// Shutdown or drain has begun; no new jobs are accepted
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    /// The drain deadline passed with jobs still queued
    #[error("Drain timed out with {remaining} jobs not dispatched")]
    DrainTimeout {
        /// Jobs abandoned in the queue
        remaining: usize,
    },
}

/// Fixed set of workers draining a bounded queue into an event bus.
pub struct WorkerPool {
    sender: RwLock<Option<mpsc::Sender<PublishJob>>>,
    receiver: Arc<Mutex<mpsc::Receiver<PublishJob>>>,
    stop: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `config.workers` workers publishing to `bus`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, config: &WorkerPoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let stop = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&bus),
                    Arc::clone(&receiver),
                    stop.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = worker_count, queue_capacity = capacity, "Worker pool started");

        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            stop,
            workers: Mutex::new(workers),
            capacity,
        }
    }

    /// Enqueue a publish without waiting.
    ///
    /// # Errors
    ///
    /// - [`WorkerPoolError::QueueFull`] if the queue is at capacity
    /// - [`WorkerPoolError::ShuttingDown`] after `shutdown` or `drain` began
    pub fn publish_async(
        &self,
        topic: impl Into<String>,
        envelope: EventEnvelope,
    ) -> Result<(), WorkerPoolError> {
        let topic = topic.into();
        let Ok(guard) = self.sender.read() else {
            return Err(WorkerPoolError::ShuttingDown);
        };
        let Some(sender) = guard.as_ref() else {
            WorkerPoolMetrics::record_rejected("shutting_down");
            return Err(WorkerPoolError::ShuttingDown);
        };

        match sender.try_send(PublishJob { topic, envelope }) {
            Ok(()) => {
                WorkerPoolMetrics::record_accepted();
                WorkerPoolMetrics::record_queue_depth(self.capacity - sender.capacity());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                WorkerPoolMetrics::record_rejected("queue_full");
                tracing::warn!(topic = %job.topic, event_id = %job.envelope.event_id, "Worker pool queue full, rejecting event");
                Err(WorkerPoolError::QueueFull { topic: job.topic })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                WorkerPoolMetrics::record_rejected("shutting_down");
                Err(WorkerPoolError::ShuttingDown)
            }
        }
    }

    /// Jobs waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|s| self.capacity - s.capacity()))
            .unwrap_or(0)
    }

    /// Whether new jobs are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.sender.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting jobs, wait for in-flight publishes, abandon queued jobs.
    ///
    /// Returns the number of abandoned jobs.
    pub async fn shutdown(&self) -> usize {
        self.close_intake();
        self.stop.cancel();
        self.join_workers().await;

        let abandoned = self.discard_queued().await;
        if abandoned > 0 {
            tracing::warn!(abandoned, "Worker pool shut down with queued jobs abandoned");
        } else {
            tracing::info!("Worker pool shut down");
        }
        abandoned
    }

    /// Stop accepting jobs and dispatch every queued job before stopping.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerPoolError::DrainTimeout`] if the queue is not empty by
    /// `timeout`. Workers then finish their in-flight publish and the remaining jobs
    /// are abandoned.
    pub async fn drain(&self, timeout: Duration) -> Result<(), WorkerPoolError> {
        self.close_intake();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        // One join future for both phases: a handle must not be polled after it completed
        let mut joined = pin!(join_all(handles));
        if tokio::time::timeout(timeout, joined.as_mut()).await.is_ok() {
            tracing::info!("Worker pool drained");
            return Ok(());
        }

        self.stop.cancel();
        joined.await;

        let remaining = self.discard_queued().await;
        tracing::warn!(remaining, "Worker pool drain timed out");
        Err(WorkerPoolError::DrainTimeout { remaining })
    }

    fn close_intake(&self) {
        match self.sender.write() {
            Ok(mut sender) => {
                sender.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }

    async fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }

    async fn discard_queued(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        WorkerPoolMetrics::record_queue_depth(0);
        discarded
    }
}

async fn worker_loop(
    id: usize,
    bus: Arc<dyn EventBus>,
    receiver: Arc<Mutex<mpsc::Receiver<PublishJob>>>,
    stop: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };

        // Channel closed and empty: the pool is draining and nothing is left
        let Some(job) = job else { break };

        WorkerPoolMetrics::record_dispatched();
        match bus.publish(&job.topic, &job.envelope).await {
            Ok(entry_id) => {
                tracing::debug!(worker = id, topic = %job.topic, entry_id = %entry_id, "Dispatched event");
            }
            Err(e) => {
                WorkerPoolMetrics::record_dispatch_error();
                tracing::warn!(
                    worker = id,
                    topic = %job.topic,
                    event_id = %job.envelope.event_id,
                    error = %e,
                    "Failed to publish event, discarding job"
                );
            }
        }
    }

    tracing::debug!(worker = id, "Worker stopped");
}
