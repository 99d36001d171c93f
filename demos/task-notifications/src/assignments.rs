//! Task assignment: the business write that produces a [`TaskAssigned`] event.
//!
//! The assignment row and the outbox row are written in one transaction, so the
//! notification exists exactly when the assignment does.

use crate::events::TaskAssigned;
use outflow_core::outbox::{OutboxError, OutboxEvent, OutboxStore};
use outflow_postgres::PostgresOutboxStore;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while assigning a task.
#[derive(Error, Debug)]
pub enum AssignmentError {
    /// Writing the assignment failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Staging the outbox event failed
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

/// Who is assigned to what.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Task id
    pub task_id: Uuid,
    /// Task title
    pub task_title: String,
    /// Assignee id
    pub user_id: Uuid,
    /// Assignee email
    pub user_email: String,
    /// Assignee display name
    pub user_name: String,
}

/// Create the `task_assignments` table if it does not exist.
///
/// # Errors
///
/// Returns [`AssignmentError::Database`] if the statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), AssignmentError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS task_assignments (
            id UUID PRIMARY KEY,
            task_id UUID NOT NULL,
            user_id UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the assignment and stage its notification event atomically.
///
/// Returns the assignment id.
///
/// # Errors
///
/// Returns [`AssignmentError`] if either write or the commit fails; nothing is
/// persisted in that case.
pub async fn assign_task(
    store: &PostgresOutboxStore,
    assignment: &Assignment,
) -> Result<Uuid, AssignmentError> {
    let mut tx = store.begin().await?;

    let assignment_id = Uuid::new_v4();
    sqlx::query("INSERT INTO task_assignments (id, task_id, user_id) VALUES ($1, $2, $3)")
        .bind(assignment_id)
        .bind(assignment.task_id)
        .bind(assignment.user_id)
        .execute(&mut *tx)
        .await?;

    let event = OutboxEvent::from_event(
        "task",
        assignment.task_id.to_string(),
        &TaskAssigned {
            task_id: assignment.task_id.to_string(),
            task_title: assignment.task_title.clone(),
            user_id: assignment.user_id.to_string(),
            user_email: assignment.user_email.clone(),
            user_name: assignment.user_name.clone(),
        },
    )?;
    store.create(&mut tx, &event).await?;

    // Dropping `tx` on any error above rolls both writes back
    tx.commit().await?;

    tracing::info!(
        assignment_id = %assignment_id,
        task_id = %assignment.task_id,
        user_id = %assignment.user_id,
        event_id = %event.id,
        "Task assigned"
    );
    Ok(assignment_id)
}
