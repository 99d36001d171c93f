//! Redis Streams implementation of [`StreamTransport`].
//!
//! | operation      | command                                               |
//! |----------------|-------------------------------------------------------|
//! | `append`       | `XADD topic * event_data <bytes>`                     |
//! | `create_group` | `XGROUP CREATE topic group 0 MKSTREAM`                |
//! | `read_pending` | `XREADGROUP GROUP g c COUNT n STREAMS topic <after>`  |
//! | `read_new`     | `XREADGROUP GROUP g c COUNT n BLOCK ms STREAMS topic >` |
//! | `ack`          | `XACK topic group id`                                 |
//!
//! Short commands share one [`ConnectionManager`], which reconnects on its own.
//! Blocking reads hold their connection for up to the block timeout, so each topic gets
//! a dedicated multiplexed connection for them; a reader that fails is dropped and
//! reopened on the next read.

use outflow_core::stream::{
    EntryId, FieldMap, GroupCreation, StreamEntry, StreamTransport, TransportError,
};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;

fn command_error(operation: &'static str, topic: &str, e: &RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        TransportError::Connection(format!("{operation} on '{topic}': {e}"))
    } else {
        TransportError::command(operation, topic, e)
    }
}

/// Redis Streams log shared by publishers and subscription loops.
pub struct RedisStreamTransport {
    client: Client,
    conn: ConnectionManager,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamTransport {
    /// Connect to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = Client::open(redis_url).map_err(|e| {
            TransportError::Connection(format!("Failed to create Redis client: {e}"))
        })?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            TransportError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the server does not answer.
    pub async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Connection(format!("PING failed: {e}")))?;
        Ok(())
    }

    async fn reader(&self, topic: &str) -> Result<MultiplexedConnection, TransportError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(topic) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| command_error("connect", topic, &e))?;
        tracing::debug!(topic = %topic, "Opened dedicated read connection");
        readers.insert(topic.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_reader(&self, topic: &str) {
        self.readers.lock().await.remove(topic);
    }

    fn entries_from_reply(
        topic: &str,
        reply: Option<StreamReadReply>,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = FieldMap::new();
                for (name, value) in &id.map {
                    let bytes: Vec<u8> = redis::from_redis_value(value).map_err(|e| {
                        TransportError::Protocol(format!(
                            "field '{name}' of entry {} on '{topic}': {e}",
                            id.id
                        ))
                    })?;
                    fields.insert(name.clone(), bytes);
                }
                entries.push(StreamEntry {
                    topic: topic.to_string(),
                    id: EntryId::new(id.id),
                    fields,
                });
            }
        }
        Ok(entries)
    }

    async fn read_group(
        &self,
        topic: &str,
        start: &str,
        options: StreamReadOptions,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut conn = self.reader(topic).await?;
        let reply: Result<Option<StreamReadReply>, RedisError> =
            conn.xread_options(&[topic], &[start], &options).await;

        match reply {
            Ok(reply) => Self::entries_from_reply(topic, reply),
            Err(e) => {
                let err = command_error("read", topic, &e);
                if matches!(err, TransportError::Connection(_)) {
                    self.drop_reader(topic).await;
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for RedisStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamTransport")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .finish_non_exhaustive()
    }
}

impl StreamTransport for RedisStreamTransport {
    fn append(
        &self,
        topic: &str,
        fields: FieldMap,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let items: Vec<(String, Vec<u8>)> = fields.into_iter().collect();
            let id: String = conn
                .xadd(&topic, "*", &items)
                .await
                .map_err(|e| command_error("append", &topic, &e))?;
            Ok(EntryId::new(id))
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
            let mut conn = self.conn.clone();
            let created: Result<(), RedisError> =
                conn.xgroup_create_mkstream(&topic, &group, "0").await;

            match created {
                Ok(()) => Ok(GroupCreation::Created),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
                Err(e) => Err(command_error("create_group", &topic, &e)),
            }
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
        let start = after.map_or_else(|| "0".to_string(), |id| id.as_str().to_string());
        let options = StreamReadOptions::default().group(group, consumer).count(count);
        Box::pin(async move { self.read_group(&topic, &start, options).await })
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
        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK 0 waits forever; a zero timeout means "don't block"
        if !block.is_zero() {
            let millis = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
            options = options.block(millis);
        }
        Box::pin(async move { self.read_group(&topic, ">", options).await })
    }

    fn ack(
        &self,
        topic: &str,
        group: &str,
        id: &EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let id = id.as_str().to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .xack(&topic, &group, &[&id])
                .await
                .map_err(|e| command_error("ack", &topic, &e))?;
            Ok(())
        })
    }
}
