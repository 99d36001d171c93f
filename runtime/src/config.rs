//! Runtime configuration.
//!
//! Each component takes a plain config struct with production defaults. `from_env`
//! constructors read `OUTFLOW_*` variables and fall back to the default for any variable
//! that is absent or does not parse.
//!
//! | variable | default |
//! |---|---|
//! | `OUTFLOW_BUS_BATCH_SIZE` | 50 |
//! | `OUTFLOW_BUS_BLOCK_TIMEOUT_MS` | 1000 |
//! | `OUTFLOW_BUS_MAX_RETRIES` | 3 |
//! | `OUTFLOW_BUS_BACKOFF_UNIT_MS` | 1000 |
//! | `OUTFLOW_OUTBOX_INTERVAL_MS` | 5000 |
//! | `OUTFLOW_OUTBOX_BATCH_SIZE` | 50 |
//! | `OUTFLOW_OUTBOX_MAX_RETRIES` | 5 |
//! | `OUTFLOW_WORKERS` | 10 |
//! | `OUTFLOW_QUEUE_CAPACITY` | 1000 |

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(default, Duration::from_millis)
}

/// Consumption settings for a stream event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Entries per read
    pub batch_size: usize,
    /// How long a read waits for new entries
    pub block_timeout: Duration,
    /// Handler retries after the first failed attempt
    pub max_retries: u32,
    /// Retry `n` waits `n * backoff_unit`
    pub backoff_unit: Duration,
    /// Pause after a transport error before the next read
    pub error_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            block_timeout: Duration::from_secs(1),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    /// Load from `OUTFLOW_BUS_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_or("OUTFLOW_BUS_BATCH_SIZE", defaults.batch_size).max(1),
            block_timeout: env_millis_or("OUTFLOW_BUS_BLOCK_TIMEOUT_MS", defaults.block_timeout),
            max_retries: env_or("OUTFLOW_BUS_MAX_RETRIES", defaults.max_retries),
            backoff_unit: env_millis_or("OUTFLOW_BUS_BACKOFF_UNIT_MS", defaults.backoff_unit),
            error_backoff: defaults.error_backoff,
        }
    }
}

/// Polling settings for the outbox processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Time between ticks
    pub poll_interval: Duration,
    /// Rows fetched per tick
    pub batch_size: i64,
    /// Retry ceiling; a row whose retry count reaches it is abandoned
    pub max_retries: i32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 5,
        }
    }
}

impl OutboxConfig {
    /// Load from `OUTFLOW_OUTBOX_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis_or("OUTFLOW_OUTBOX_INTERVAL_MS", defaults.poll_interval),
            batch_size: env_or("OUTFLOW_OUTBOX_BATCH_SIZE", defaults.batch_size).max(1),
            max_retries: env_or("OUTFLOW_OUTBOX_MAX_RETRIES", defaults.max_retries).max(1),
        }
    }
}

/// Sizing of the publish worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Bounded queue capacity
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1000,
        }
    }
}

impl WorkerPoolConfig {
    /// Load from `OUTFLOW_WORKERS` and `OUTFLOW_QUEUE_CAPACITY`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_or("OUTFLOW_WORKERS", defaults.workers).max(1),
            queue_capacity: env_or("OUTFLOW_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
        }
    }
}

/// All runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutflowConfig {
    /// Event bus consumption
    pub bus: BusConfig,
    /// Outbox polling
    pub outbox: OutboxConfig,
    /// Publish worker pool
    pub workers: WorkerPoolConfig,
}

impl OutflowConfig {
    /// Load every section from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            workers: WorkerPoolConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OutflowConfig::default();
        assert_eq!(config.bus.batch_size, 50);
        assert_eq!(config.bus.block_timeout, Duration::from_secs(1));
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.bus.backoff_unit, Duration::from_secs(1));
        assert_eq!(config.outbox.poll_interval, Duration::from_secs(5));
        assert_eq!(config.outbox.batch_size, 50);
        assert_eq!(config.outbox.max_retries, 5);
        assert_eq!(config.workers.workers, 10);
        assert_eq!(config.workers.queue_capacity, 1000);
    }

    #[test]
    fn absent_values_fall_back() {
        assert_eq!(env_or("OUTFLOW_TEST_UNSET_VARIABLE", 7_usize), 7);
        assert_eq!(
            env_millis_or("OUTFLOW_TEST_UNSET_MILLIS", Duration::from_millis(3)),
            Duration::from_millis(3)
        );
    }
}
