//! Notification listener for task assignments.
//!
//! Delivery is at-least-once, so the listener remembers the most recent `event_id`s it
//! has mailed and skips redeliveries. The memory is per process and bounded; a
//! redelivery older than the window, or one after a restart, is mailed again.

use crate::events::TaskAssigned;
use outflow_core::event::EventEnvelope;
use outflow_core::handler::{EventHandler, HandlerError};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use uuid::Uuid;

/// An outgoing notification email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
}

/// Sends notification emails.
pub trait Mailer: Send + Sync {
    /// Send one email.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; the bus retries the event.
    fn send(&self, email: &Email) -> Result<(), String>;
}

/// Mailer that writes the email to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: &Email) -> Result<(), String> {
        tracing::info!(to = %email.to, subject = %email.subject, body = %email.body, "Email sent");
        Ok(())
    }
}

/// Default number of event ids remembered for deduplication.
pub const DEFAULT_DEDUPE_WINDOW: usize = 10_000;

/// Most recently delivered event ids, oldest evicted first.
#[derive(Default)]
struct Delivered {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

/// Mails the assignee of every [`TaskAssigned`] event once.
pub struct AssignmentNotifier<M> {
    mailer: M,
    delivered: Mutex<Delivered>,
    window: usize,
}

impl<M: Mailer> AssignmentNotifier<M> {
    /// Create a notifier sending through `mailer`.
    pub fn new(mailer: M) -> Self {
        Self::with_dedupe_window(mailer, DEFAULT_DEDUPE_WINDOW)
    }

    /// Create a notifier remembering at most `window` event ids (at least 1).
    pub fn with_dedupe_window(mailer: M, window: usize) -> Self {
        Self {
            mailer,
            delivered: Mutex::new(Delivered::default()),
            window: window.max(1),
        }
    }

    fn already_delivered(&self, event_id: Uuid) -> bool {
        self.delivered
            .lock()
            .map(|delivered| delivered.ids.contains(&event_id))
            .unwrap_or(false)
    }

    fn remember(&self, event_id: Uuid) {
        let Ok(mut delivered) = self.delivered.lock() else {
            return;
        };
        if !delivered.ids.insert(event_id) {
            return;
        }
        delivered.order.push_back(event_id);
        while delivered.order.len() > self.window {
            if let Some(oldest) = delivered.order.pop_front() {
                delivered.ids.remove(&oldest);
            }
        }
    }

    fn notify(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        if self.already_delivered(envelope.event_id) {
            tracing::debug!(event_id = %envelope.event_id, "Duplicate delivery, notification already sent");
            return Ok(());
        }

        let event: TaskAssigned = envelope.decode()?;
        if event.user_email.is_empty() {
            return Err(HandlerError::malformed(format!(
                "assignee {} of task {} has no email address",
                event.user_id, event.task_id
            )));
        }

        let email = Email {
            to: event.user_email.clone(),
            subject: format!("New task assigned: {}", event.task_title),
            body: format!("Hello {}, you have been assigned to \"{}\".", event.user_name, event.task_title),
        };
        self.mailer.send(&email).map_err(HandlerError::failed)?;
        self.remember(envelope.event_id);

        tracing::info!(
            event_id = %envelope.event_id,
            task_id = %event.task_id,
            user_id = %event.user_id,
            "Assignment notification sent"
        );
        Ok(())
    }
}

impl<M: Mailer> EventHandler for AssignmentNotifier<M> {
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move { self.notify(envelope) })
    }
}
