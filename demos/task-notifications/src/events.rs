//! Events exchanged by the task module.

use outflow_core::event::DomainEvent;
use outflow_core::registry::EventRegistry;
use serde::{Deserialize, Serialize};

/// A user was assigned to a task. Written through the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssigned {
    /// Task id
    pub task_id: String,
    /// Task title, denormalized for the notification
    pub task_title: String,
    /// Assignee id
    pub user_id: String,
    /// Assignee email
    pub user_email: String,
    /// Assignee display name
    pub user_name: String,
}

impl DomainEvent for TaskAssigned {
    const EVENT_TYPE: &'static str = "task_assigned_stream";
}

/// A task was completed. Published fire-and-forget through the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDone {
    /// Task id
    pub task_id: String,
    /// Who completed it
    pub user_id: String,
}

impl DomainEvent for TaskDone {
    const EVENT_TYPE: &'static str = "task_done_stream";
}

/// Every event type this service consumes.
#[must_use]
pub fn registry() -> EventRegistry {
    EventRegistry::new()
        .register::<TaskAssigned>()
        .register::<TaskDone>()
}
