//! Redis Streams backend for outflow.
//!
//! [`RedisStreamTransport`] maps the [`StreamTransport`](outflow_core::stream::StreamTransport)
//! operations onto `XADD` / `XGROUP` / `XREADGROUP` / `XACK`, and [`RedisEventBus`] is
//! the stream event bus running over it.
//!
//! # Example
//!
//! ```no_run
//! use outflow_redis::RedisEventBusBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisEventBusBuilder::new()
//!     .url("redis://127.0.0.1:6379")
//!     .consumer_group("notifications")
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Redis Streams transport
pub mod transport;

pub use transport::RedisStreamTransport;

use outflow_core::event_bus::EventBusError;
use outflow_core::registry::EventRegistry;
use outflow_runtime::{BusConfig, StreamEventBus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Event bus over Redis Streams.
pub type RedisEventBus = StreamEventBus<RedisStreamTransport>;

/// Builder for [`RedisEventBus`].
///
/// `url` and `consumer_group` are required; everything else has a default.
#[derive(Debug, Default)]
pub struct RedisEventBusBuilder {
    url: Option<String>,
    consumer_group: Option<String>,
    consumer_name: Option<String>,
    config: Option<BusConfig>,
    registry: Option<EventRegistry>,
    cancellation: Option<CancellationToken>,
}

impl RedisEventBusBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Redis URL, e.g. `redis://127.0.0.1:6379`.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Consumer group shared by every instance of this service.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Consumer name of this instance (default `"{hostname}-{pid}"`).
    #[must_use]
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    /// Delivery settings (default [`BusConfig::default`]).
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Dead-letter entries whose event type is not in `registry`.
    #[must_use]
    pub fn registry(mut self, registry: EventRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Stop subscription loops when `token` is cancelled.
    #[must_use]
    pub fn cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancellation = Some(token.clone());
        self
    }

    /// Connect, check the server answers `PING`, and build the bus.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::ConnectionFailed`] if `url` or `consumer_group` is missing or
    ///   the server cannot be reached
    pub async fn build(self) -> Result<RedisEventBus, EventBusError> {
        let url = self
            .url
            .ok_or_else(|| EventBusError::ConnectionFailed("Redis URL is required".into()))?;
        let group = self
            .consumer_group
            .ok_or_else(|| EventBusError::ConnectionFailed("Consumer group is required".into()))?;

        let transport = RedisStreamTransport::new(&url)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        transport
            .ping()
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;

        let mut bus = StreamEventBus::new(Arc::new(transport), group)
            .with_config(self.config.unwrap_or_default());
        if let Some(name) = self.consumer_name {
            bus = bus.with_consumer_name(name);
        }
        if let Some(registry) = self.registry {
            bus = bus.with_registry(registry);
        }
        if let Some(token) = &self.cancellation {
            bus = bus.with_cancellation(token);
        }

        tracing::info!(group = %bus.group(), consumer = %bus.consumer_name(), "Connected to Redis event bus");
        Ok(bus)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_requires_url() {
        let err = RedisEventBusBuilder::new()
            .consumer_group("notifications")
            .build()
            .await
            .err().unwrap();
        assert!(matches!(err, EventBusError::ConnectionFailed(ref m) if m.contains("URL")));
    }

    #[tokio::test]
    async fn build_requires_consumer_group() {
        let err = RedisEventBusBuilder::new()
            .url("redis://127.0.0.1:6379")
            .build()
            .await
            .err().unwrap();
        assert!(matches!(err, EventBusError::ConnectionFailed(ref m) if m.contains("group")));
    }

    #[tokio::test]
    async fn build_rejects_invalid_url() {
        let err = RedisEventBusBuilder::new()
            .url("not a url")
            .consumer_group("notifications")
            .build()
            .await
            .err().unwrap();
        assert!(matches!(err, EventBusError::ConnectionFailed(_)));
    }
}
