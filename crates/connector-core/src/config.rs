// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::retry::EntityRetryPolicy;
use crate::wait::ExponentialWaitStrategy;

/// Settings shared by every entity manager, overridable per manager through an
/// environment variable prefix (e.g. `TRANSFER_BATCH_SIZE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityManagerConfig {
    /// Max entities fetched-and-leased per processor invocation
    pub batch_size: usize,
    /// First idle back-off
    pub iteration_wait: Duration,
    /// Cap on the idle back-off
    pub iteration_wait_max: Duration,
    /// Validity window of leases taken by this manager
    pub lease_duration: Duration,
    /// Retries allowed per state before an entity is terminated
    pub retry_limit: u32,
    /// First entity retry delay, doubled per further retry
    pub retry_base_delay: Duration,
    /// Cap on the entity retry delay
    pub retry_max_delay: Duration,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            iteration_wait: Duration::from_millis(1_000),
            iteration_wait_max: Duration::from_millis(30_000),
            lease_duration: Duration::from_millis(60_000),
            retry_limit: 7,
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_millis(60_000),
        }
    }
}

impl EntityManagerConfig {
    /// Load configuration from environment variables named `{prefix}_*`.
    ///
    /// Optional (with defaults):
    /// - `{prefix}_BATCH_SIZE`: entities per batch (default: 20)
    /// - `{prefix}_ITERATION_WAIT_MS`: first idle back-off (default: 1000)
    /// - `{prefix}_ITERATION_WAIT_MAX_MS`: idle back-off cap (default: 30000)
    /// - `{prefix}_LEASE_DURATION_MS`: lease validity (default: 60000)
    /// - `{prefix}_RETRY_LIMIT`: retries per state (default: 7)
    /// - `{prefix}_RETRY_BASE_DELAY_MS`: first entity retry delay (default: 1000)
    /// - `{prefix}_RETRY_MAX_DELAY_MS`: entity retry delay cap (default: 60000)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let batch_size: usize = parse_var(prefix, "BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid(
                var_name(prefix, "BATCH_SIZE"),
                "must be a positive integer",
            ));
        }

        let lease_duration = millis_var(prefix, "LEASE_DURATION_MS", defaults.lease_duration)?;
        if lease_duration.is_zero() {
            return Err(ConfigError::Invalid(
                var_name(prefix, "LEASE_DURATION_MS"),
                "must be a positive number of milliseconds",
            ));
        }

        let iteration_wait = millis_var(prefix, "ITERATION_WAIT_MS", defaults.iteration_wait)?;
        let iteration_wait_max =
            millis_var(prefix, "ITERATION_WAIT_MAX_MS", defaults.iteration_wait_max)?;
        if iteration_wait_max < iteration_wait {
            return Err(ConfigError::Invalid(
                var_name(prefix, "ITERATION_WAIT_MAX_MS"),
                "must not be smaller than ITERATION_WAIT_MS",
            ));
        }

        Ok(Self {
            batch_size,
            iteration_wait,
            iteration_wait_max,
            lease_duration,
            retry_limit: parse_var(prefix, "RETRY_LIMIT", defaults.retry_limit)?,
            retry_base_delay: millis_var(prefix, "RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_max_delay: millis_var(prefix, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
        })
    }

    /// Idle back-off doubling from `iteration_wait` up to `iteration_wait_max`.
    pub fn wait_strategy(&self) -> ExponentialWaitStrategy {
        ExponentialWaitStrategy::new(self.iteration_wait, self.iteration_wait_max, 2)
    }

    /// Entity retry policy built from the `retry_*` settings.
    pub fn retry_policy(&self) -> EntityRetryPolicy {
        EntityRetryPolicy {
            retry_limit: self.retry_limit,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

fn var_name(prefix: &str, key: &str) -> String {
    format!("{}_{}", prefix, key)
}

fn parse_var<T: std::str::FromStr>(prefix: &str, key: &str, default: T) -> Result<T, ConfigError> {
    let name = var_name(prefix, key);
    match std::env::var(&name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn millis_var(prefix: &str, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(prefix, key, default_ms).map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(String),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(String, &'static str),
}
