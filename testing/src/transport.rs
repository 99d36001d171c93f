//! In-memory stream transport.
//!
//! Models the consumer-group semantics the event bus relies on:
//! - entries get monotonically increasing ids `"1-0"`, `"2-0"`, ...
//! - each group has one read cursor; `read_new` hands entries to a consumer and
//!   records them as pending for that consumer
//! - `ack` removes an entry from the pending set
//! - `read_pending` returns a consumer's unacknowledged entries in id order
//!
//! Failures can be injected per operation to exercise the bus's error paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use outflow_core::event::EventEnvelope;
use outflow_core::stream::{
    EntryId, FieldMap, GroupCreation, StreamEntry, StreamTransport, TransportError,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Group {
    cursor: usize,
    // entry index -> consumer name
    pending: BTreeMap<usize, String>,
    deliveries: HashMap<usize, u32>,
}

#[derive(Debug, Default)]
struct Topic {
    entries: Vec<FieldMap>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Failures {
    reads: usize,
    acks: usize,
    group_creations: usize,
    appends: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    failures: Failures,
}

/// In-memory log with consumer groups, for fast deterministic tests.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use outflow_core::stream::{FieldMap, StreamTransport};
/// use outflow_testing::InMemoryStreamTransport;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let transport = InMemoryStreamTransport::new();
/// transport.create_group("orders", "billing").await.unwrap();
/// transport.append("orders", FieldMap::new()).await.unwrap();
///
/// let batch = transport
///     .read_new("orders", "billing", "worker-1", 10, Duration::ZERO)
///     .await
///     .unwrap();
/// assert_eq!(batch.len(), 1);
/// assert_eq!(transport.pending("orders", "billing").len(), 1);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStreamTransport {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
}

fn entry_id(index: usize) -> EntryId {
    EntryId::new(format!("{}-0", index + 1))
}

fn entry_index(id: &EntryId) -> Option<usize> {
    let (seq, _) = id.as_str().split_once('-')?;
    seq.parse::<usize>().ok()?.checked_sub(1)
}

fn no_group(operation: &'static str, topic: &str, group: &str) -> TransportError {
    TransportError::command(
        operation,
        topic,
        format!("NOGROUP No such consumer group '{group}'"),
    )
}

impl InMemoryStreamTransport {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads (pending or new) fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.state.lock().unwrap().failures.reads = n;
    }

    /// Make the next `n` acknowledgements fail.
    pub fn fail_next_acks(&self, n: usize) {
        self.state.lock().unwrap().failures.acks = n;
    }

    /// Make the next `n` group creations fail.
    pub fn fail_next_group_creations(&self, n: usize) {
        self.state.lock().unwrap().failures.group_creations = n;
    }

    /// Make the next `n` appends to `topic` fail.
    pub fn fail_next_appends_to(&self, topic: &str, n: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .appends
            .insert(topic.to_string(), n);
    }

    /// All entries appended to `topic`, in order.
    #[must_use]
    pub fn entries(&self, topic: &str) -> Vec<StreamEntry> {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .map(|t| {
                t.entries
                    .iter()
                    .enumerate()
                    .map(|(i, fields)| StreamEntry {
                        topic: topic.to_string(),
                        id: entry_id(i),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries appended to `topic`.
    #[must_use]
    pub fn len(&self, topic: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.topics.get(topic).map_or(0, |t| t.entries.len())
    }

    /// Whether `topic` has no entries.
    #[must_use]
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Decoded envelopes of every entry of `topic` that carries one.
    #[must_use]
    pub fn envelopes(&self, topic: &str) -> Vec<EventEnvelope> {
        self.entries(topic)
            .iter()
            .filter_map(|e| EventEnvelope::from_bytes(e.event_data()?).ok())
            .collect()
    }

    /// Ids pending in `group` on `topic`, across all consumers.
    #[must_use]
    pub fn pending(&self, topic: &str, group: &str) -> Vec<EntryId> {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.keys().map(|&i| entry_id(i)).collect())
            .unwrap_or_default()
    }

    /// How many times `id` has been handed to a consumer of `group`.
    #[must_use]
    pub fn delivery_count(&self, topic: &str, group: &str, id: &EntryId) -> u32 {
        let state = self.state.lock().unwrap();
        let Some(index) = entry_index(id) else {
            return 0;
        };
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.deliveries.get(&index).copied())
            .unwrap_or(0)
    }

    /// Whether `group` exists on `topic`.
    #[must_use]
    pub fn has_group(&self, topic: &str, group: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .topics
            .get(topic)
            .is_some_and(|t| t.groups.contains_key(group))
    }

    fn take_read_failure(state: &mut State, topic: &str) -> Result<(), TransportError> {
        if state.failures.reads > 0 {
            state.failures.reads -= 1;
            return Err(TransportError::command("read", topic, "injected read failure"));
        }
        Ok(())
    }

    fn try_read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::take_read_failure(&mut state, topic)?;

        let t = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| no_group("read", topic, group))?;
        let g = t
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group("read", topic, group))?;

        let end = t.entries.len().min(g.cursor + count);
        let batch = (g.cursor..end)
            .map(|i| {
                g.pending.insert(i, consumer.to_string());
                *g.deliveries.entry(i).or_insert(0) += 1;
                StreamEntry {
                    topic: topic.to_string(),
                    id: entry_id(i),
                    fields: t.entries[i].clone(),
                }
            })
            .collect();
        g.cursor = end;
        Ok(batch)
    }
}

impl StreamTransport for InMemoryStreamTransport {
    fn append(
        &self,
        topic: &str,
        fields: FieldMap,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let id = {
                let mut state = self.state.lock().unwrap();
                if let Some(remaining) = state.failures.appends.get_mut(&topic) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(TransportError::command(
                            "append",
                            &topic,
                            "injected append failure",
                        ));
                    }
                }
                let t = state.topics.entry(topic).or_default();
                t.entries.push(fields);
                entry_id(t.entries.len() - 1)
            };
            self.appended.notify_waiters();
            Ok(id)
        })
    }

    fn create_group(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<GroupCreation, TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.failures.group_creations > 0 {
                state.failures.group_creations -= 1;
                return Err(TransportError::command(
                    "create_group",
                    &topic,
                    "injected group creation failure",
                ));
            }
            let t = state.topics.entry(topic).or_default();
            if t.groups.contains_key(&group) {
                return Ok(GroupCreation::AlreadyExists);
            }
            t.groups.insert(group, Group::default());
            Ok(GroupCreation::Created)
        })
    }

    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&EntryId>,
        count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let after = after.and_then(entry_index);
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            Self::take_read_failure(&mut state, &topic)?;

            let t = state
                .topics
                .get_mut(&topic)
                .ok_or_else(|| no_group("read", &topic, &group))?;
            let g = t
                .groups
                .get_mut(&group)
                .ok_or_else(|| no_group("read", &topic, &group))?;

            let indices: Vec<usize> = g
                .pending
                .iter()
                .filter(|(i, owner)| after.is_none_or(|a| **i > a) && **owner == consumer)
                .map(|(i, _)| *i)
                .take(count)
                .collect();

            Ok(indices
                .into_iter()
                .map(|i| {
                    *g.deliveries.entry(i).or_insert(0) += 1;
                    StreamEntry {
                        topic: topic.clone(),
                        id: entry_id(i),
                        fields: t.entries[i].clone(),
                    }
                })
                .collect())
        })
    }

    fn read_new(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StreamEntry>, TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + block;
            loop {
                let appended = self.appended.notified();
                tokio::pin!(appended);
                // Register interest before checking so an append in between is not missed
                appended.as_mut().enable();

                let batch = self.try_read_new(&topic, &group, &consumer, count)?;
                if !batch.is_empty() || block.is_zero() {
                    return Ok(batch);
                }
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn ack(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let index = entry_index(id);
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.failures.acks > 0 {
                state.failures.acks -= 1;
                return Err(TransportError::command("ack", &topic, "injected ack failure"));
            }
            let g = state
                .topics
                .get_mut(&topic)
                .and_then(|t| t.groups.get_mut(&group))
                .ok_or_else(|| no_group("ack", &topic, &group))?;
            if let Some(index) = index {
                g.pending.remove(&index);
            }
            Ok(())
        })
    }
}
