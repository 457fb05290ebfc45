// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the state machine engine.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by leases, stores, processors and the state machine loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A live lease held by another holder exists for the entity.
    #[error("Entity '{entity_id}' is leased by '{holder}'")]
    LeaseConflict {
        /// The leased entity.
        entity_id: String,
        /// The holder that currently owns the lease.
        holder: String,
    },

    /// Entity was not found in the store.
    #[error("Entity '{entity_id}' not found")]
    EntityNotFound {
        /// The entity ID that was not found.
        entity_id: String,
    },

    /// Entity already exists (duplicate create).
    #[error("Entity '{entity_id}' already exists")]
    EntityAlreadyExists {
        /// The entity ID that already exists.
        entity_id: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// Whether retrying the operation may succeed.
        transient: bool,
    },

    /// Entity payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is invalid for the requested operation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The state machine loop is already running.
    #[error("State machine '{0}' is already running")]
    AlreadyRunning(String),

    /// A processing function failed.
    #[error("Processing failed for entity '{entity_id}': {reason}")]
    Processing {
        /// The entity being processed.
        entity_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// The background loop task could not be joined.
    #[error("State machine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Shorthand for a lease conflict on `entity_id`.
    pub fn lease_conflict(entity_id: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::LeaseConflict {
            entity_id: entity_id.into(),
            holder: holder.into(),
        }
    }

    /// Shorthand for a missing entity.
    pub fn not_found(entity_id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            entity_id: entity_id.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::LeaseConflict { .. } => "LEASE_CONFLICT",
            Self::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            Self::EntityAlreadyExists { .. } => "ENTITY_ALREADY_EXISTS",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Processing { .. } => "PROCESSING_FAILED",
            Self::Join(_) => "TASK_FAILED",
        }
    }

    /// Whether the failure is worth retrying (timeouts, pool exhaustion, busy database).
    ///
    /// Lease conflicts are not transient: the entity is simply owned by someone else.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { transient: true, .. })
    }

    /// Whether this is a lease conflict.
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_code(&code)),
            _ => false,
        };
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
            transient,
        }
    }
}

/// Transient database error codes.
///
/// PostgreSQL reports five-character SQLSTATEs (serialization_failure,
/// deadlock_detected). SQLite reports extended result codes of at most four
/// digits whose low byte is the primary code (SQLITE_BUSY, SQLITE_LOCKED).
fn is_transient_code(code: &str) -> bool {
    if code.len() == 5 {
        return matches!(code, "40001" | "40P01");
    }
    code.parse::<i32>()
        .is_ok_and(|sqlite| matches!(sqlite & 0xff, 5 | 6))
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
            transient: false,
        }
    }
}
