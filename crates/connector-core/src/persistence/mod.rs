// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Store and lease backends.
//!
//! - [`memory`]: in-process, for tests and single-node embedding
//! - [`sqlite`]: SQLite via sqlx
//! - [`postgres`]: PostgreSQL via sqlx, safe across connector instances
//!
//! The database backends share one schema (`state_entities`, `entity_leases`).
//! Entity payloads are stored as JSON next to the indexed core columns; all
//! timestamps are epoch milliseconds so expiry arithmetic is plain integer
//! comparison inside the database.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::{InMemoryBackend, InMemoryLeaseContext, InMemoryStore};
pub use self::postgres::{PostgresEntityStore, PostgresLeaseContext};
pub use self::sqlite::{SqliteEntityStore, SqliteLeaseContext};

use std::time::Duration;

use crate::clock::from_millis;
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::Lease;

/// Lease row from the `entity_leases` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LeaseRow {
    pub entity_id: String,
    pub lease_holder: String,
    pub leased_at_ms: i64,
    pub lease_duration_ms: i64,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            entity_id: row.entity_id,
            lease_holder: row.lease_holder,
            leased_at: from_millis(row.leased_at_ms),
            lease_duration: Duration::from_millis(row.lease_duration_ms.max(0) as u64),
        }
    }
}

/// Column values written for an entity.
pub(crate) struct EncodedEntity {
    pub id: String,
    pub state: i32,
    pub state_count: i32,
    pub state_timestamp_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub error_detail: Option<String>,
    pub trace_context: String,
    pub payload: String,
}

pub(crate) fn encode<E: StatefulEntity>(entity: &E) -> Result<EncodedEntity> {
    let core = entity.core();
    Ok(EncodedEntity {
        id: core.id.clone(),
        state: core.state,
        state_count: core.state_count,
        state_timestamp_ms: core.state_timestamp.timestamp_millis(),
        created_at_ms: core.created_at.timestamp_millis(),
        updated_at_ms: core.updated_at.timestamp_millis(),
        error_detail: core.error_detail.clone(),
        trace_context: serde_json::to_string(&core.trace_context)?,
        payload: serde_json::to_string(entity)?,
    })
}

pub(crate) fn decode<E: StatefulEntity>(payload: &str) -> Result<E> {
    Ok(serde_json::from_str(payload)?)
}

/// Map a unique-key violation on insert to `EntityAlreadyExists`.
pub(crate) fn map_insert_error(err: sqlx::Error, entity_id: &str) -> EngineError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            EngineError::EntityAlreadyExists {
                entity_id: entity_id.to_string(),
            }
        }
        _ => err.into(),
    }
}

/// Clamp a batch limit into the range SQL `LIMIT` accepts.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
