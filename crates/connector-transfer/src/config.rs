// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Daemon configuration loading from environment variables.

use connector_core::{ConfigError, EntityManagerConfig};

/// Prefix of the transfer manager's engine settings (`CONNECTOR_TRANSFER_BATCH_SIZE`, ...).
pub const TRANSFER_PREFIX: &str = "CONNECTOR_TRANSFER";

/// Connector daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Lease holder identity of this connector instance
    pub runtime_id: String,
    /// PostgreSQL pool size
    pub max_connections: u32,
    /// Assets served by the in-memory asset index
    pub asset_ids: Vec<String>,
    /// Engine settings of the transfer process manager
    pub transfer: EntityManagerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CONNECTOR_DATABASE_URL`: PostgreSQL or SQLite (`sqlite:...`) connection string
    ///
    /// Optional (with defaults):
    /// - `CONNECTOR_RUNTIME_ID`: lease holder id (default: random UUID)
    /// - `CONNECTOR_DB_MAX_CONNECTIONS`: PostgreSQL pool size (default: 10)
    /// - `CONNECTOR_ASSET_IDS`: comma-separated asset ids (default: none)
    /// - `CONNECTOR_TRANSFER_*`: see [`EntityManagerConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONNECTOR_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CONNECTOR_DATABASE_URL".to_string()))?;

        let runtime_id = std::env::var("CONNECTOR_RUNTIME_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let max_connections: u32 = std::env::var("CONNECTOR_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "CONNECTOR_DB_MAX_CONNECTIONS".to_string(),
                    "must be a positive integer",
                )
            })?;

        let asset_ids = std::env::var("CONNECTOR_ASSET_IDS")
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            runtime_id,
            max_connections,
            asset_ids,
            transfer: EntityManagerConfig::from_env(TRANSFER_PREFIX)?,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "CONNECTOR_DATABASE_URL",
        "CONNECTOR_RUNTIME_ID",
        "CONNECTOR_DB_MAX_CONNECTIONS",
        "CONNECTOR_ASSET_IDS",
        "CONNECTOR_TRANSFER_BATCH_SIZE",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_requires_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref key) if key == "CONNECTOR_DATABASE_URL"));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CONNECTOR_DATABASE_URL", "sqlite:connector.db");

        let config = Config::from_env().unwrap();
        assert!(config.is_sqlite());
        assert_eq!(config.max_connections, 10);
        assert!(config.asset_ids.is_empty());
        assert!(uuid::Uuid::parse_str(&config.runtime_id).is_ok());
        assert_eq!(config.transfer, EntityManagerConfig::default());

        // a fresh identity per load
        let other = Config::from_env().unwrap();
        assert_ne!(config.runtime_id, other.runtime_id);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CONNECTOR_DATABASE_URL", "postgres://localhost/connector");
        guard.set("CONNECTOR_RUNTIME_ID", "connector-1");
        guard.set("CONNECTOR_DB_MAX_CONNECTIONS", "4");
        guard.set("CONNECTOR_ASSET_IDS", "asset-1, asset-2,,");
        guard.set("CONNECTOR_TRANSFER_BATCH_SIZE", "7");

        let config = Config::from_env().unwrap();
        assert!(!config.is_sqlite());
        assert_eq!(config.runtime_id, "connector-1");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.asset_ids, vec!["asset-1", "asset-2"]);
        assert_eq!(config.transfer.batch_size, 7);
    }

    #[test]
    fn test_config_invalid_pool_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CONNECTOR_DATABASE_URL", "postgres://localhost/connector");
        guard.set("CONNECTOR_DB_MAX_CONNECTIONS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("CONNECTOR_DB_MAX_CONNECTIONS"));
    }

    #[test]
    fn test_config_invalid_engine_setting() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CONNECTOR_DATABASE_URL", "sqlite::memory:");
        guard.set("CONNECTOR_TRANSFER_BATCH_SIZE", "many");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref key, _) if key == "CONNECTOR_TRANSFER_BATCH_SIZE"));
    }
}
