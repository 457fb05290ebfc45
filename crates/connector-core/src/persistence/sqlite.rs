// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store and lease context.
//!
//! SQLite executes each statement atomically under its database write lock, so
//! lease acquisition and select-and-lock are each expressed as one
//! `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement.

use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::clock::Clock;
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Lease, LeaseContext, LeaseRetryPolicy, RetryingLeaseContext, duration_millis};
use crate::store::{Criterion, StateEntityStore};

use super::{LeaseRow, decode, encode, map_insert_error, sql_limit};

/// Connect to a SQLite database URL and run migrations.
///
/// The database file is created if missing. A busy timeout keeps concurrent
/// writers on one file from failing immediately.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| EngineError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to SQLite at {}: {}", url, e),
            transient: false,
        })?;

    crate::migrations::run_sqlite(&pool).await?;
    Ok(pool)
}

/// Create and initialize a SQLite database at a file path.
///
/// Parent directories are created if they don't exist.
pub async fn from_path(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
            operation: "create_dir".to_string(),
            details: format!("Failed to create directory {:?}: {}", parent, e),
            transient: false,
        })?;
    }

    connect(&format!("sqlite:{}", path.to_string_lossy())).await
}

/// Lease context over the `entity_leases` table.
pub struct SqliteLeaseContext {
    pool: SqlitePool,
    kind: String,
    holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteLeaseContext {
    /// Create a lease context for entities of `kind`.
    pub fn new(
        pool: SqlitePool,
        kind: impl Into<String>,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            kind: kind.into(),
            holder: holder.into(),
            lease_duration,
            clock,
        }
    }
}

#[async_trait]
impl LeaseContext for SqliteLeaseContext {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn acquire_lease(&self, entity_id: &str) -> Result<Lease> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            INSERT INTO entity_leases (entity_kind, entity_id, lease_holder, leased_at_ms, lease_duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (entity_kind, entity_id) DO UPDATE
            SET lease_holder = excluded.lease_holder,
                leased_at_ms = excluded.leased_at_ms,
                lease_duration_ms = excluded.lease_duration_ms
            WHERE entity_leases.lease_holder = excluded.lease_holder
               OR entity_leases.leased_at_ms + entity_leases.lease_duration_ms <= excluded.leased_at_ms
            "#,
        )
        .bind(&self.kind)
        .bind(entity_id)
        .bind(&self.holder)
        .bind(now.timestamp_millis())
        .bind(duration_millis(self.lease_duration))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let holder = self
                .get_lease(entity_id)
                .await?
                .map(|lease| lease.lease_holder)
                .unwrap_or_default();
            return Err(EngineError::lease_conflict(entity_id, holder));
        }

        Ok(Lease {
            entity_id: entity_id.to_string(),
            lease_holder: self.holder.clone(),
            leased_at: now,
            lease_duration: self.lease_duration,
        })
    }

    async fn break_lease(&self, entity_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM entity_leases
            WHERE entity_kind = ?1 AND entity_id = ?2 AND lease_holder = ?3
            "#,
        )
        .bind(&self.kind)
        .bind(entity_id)
        .bind(&self.holder)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0
            && let Some(lease) = self.get_lease(entity_id).await?
            && !lease.is_expired(self.clock.now())
        {
            return Err(EngineError::lease_conflict(entity_id, lease.lease_holder));
        }

        Ok(())
    }

    async fn force_break_lease(&self, entity_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM entity_leases WHERE entity_kind = ?1 AND entity_id = ?2")
            .bind(&self.kind)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_lease(&self, entity_id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT entity_id, lease_holder, leased_at_ms, lease_duration_ms
            FROM entity_leases
            WHERE entity_kind = ?1 AND entity_id = ?2
            "#,
        )
        .bind(&self.kind)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Lease::from))
    }
}

/// [`StateEntityStore`] over the `state_entities` table.
///
/// Lease operations go through a [`RetryingLeaseContext`], so a write that hits
/// a busy database is retried before it surfaces as an error.
pub struct SqliteEntityStore<E> {
    pool: SqlitePool,
    lease_context: Arc<RetryingLeaseContext<SqliteLeaseContext>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatefulEntity> SqliteEntityStore<E> {
    /// Create a store for `E` whose leases are taken on behalf of `holder`.
    pub fn new(
        pool: SqlitePool,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_lease_retry(pool, holder, lease_duration, clock, LeaseRetryPolicy::default())
    }

    /// Like [`new`](Self::new) with an explicit retry policy for lease operations.
    pub fn with_lease_retry(
        pool: SqlitePool,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
        retry: LeaseRetryPolicy,
    ) -> Self {
        let lease_context = Arc::new(RetryingLeaseContext::new(
            SqliteLeaseContext::new(pool.clone(), E::KIND, holder, lease_duration, clock),
            retry,
        ));
        Self {
            pool,
            lease_context,
            _entity: PhantomData,
        }
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT payload FROM state_entities WHERE entity_kind = ",
        );
        query.push_bind(E::KIND).push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY state_timestamp_ms ASC, id ASC");

        let rows: Vec<(String,)> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.iter().map(|(payload,)| decode(payload)).collect()
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for SqliteEntityStore<E> {
    async fn next_not_leased(&self, limit: usize, criterion: &Criterion) -> Result<Vec<E>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ctx = self.lease_context.inner();
        let now_ms = ctx.clock.now_millis();

        let mut query = QueryBuilder::<Sqlite>::new(
            "INSERT INTO entity_leases (entity_kind, entity_id, lease_holder, leased_at_ms, lease_duration_ms) \
             SELECT c.entity_kind, c.id, ",
        );
        query
            .push_bind(ctx.holder.as_str())
            .push(", ")
            .push_bind(now_ms)
            .push(", ")
            .push_bind(duration_millis(ctx.lease_duration))
            .push(
                " FROM (SELECT e.entity_kind, e.id FROM state_entities e \
                 LEFT JOIN entity_leases l ON l.entity_kind = e.entity_kind AND l.entity_id = e.id \
                 WHERE e.entity_kind = ",
            )
            .push_bind(E::KIND);
        if let Some(states) = criterion.states() {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            query.push(" AND e.state IN (");
            let mut separated = query.separated(", ");
            for state in states {
                separated.push_bind(state);
            }
            separated.push_unseparated(")");
        }
        query
            .push(" AND (l.entity_id IS NULL OR l.leased_at_ms + l.lease_duration_ms <= ")
            .push_bind(now_ms)
            .push(") ORDER BY e.state_timestamp_ms ASC, e.id ASC LIMIT ")
            .push_bind(sql_limit(limit))
            .push(
                ") AS c WHERE true \
                 ON CONFLICT (entity_kind, entity_id) DO UPDATE \
                 SET lease_holder = excluded.lease_holder, \
                     leased_at_ms = excluded.leased_at_ms, \
                     lease_duration_ms = excluded.lease_duration_ms \
                 WHERE entity_leases.leased_at_ms + entity_leases.lease_duration_ms <= excluded.leased_at_ms \
                 RETURNING entity_id",
            );

        let leased: Vec<(String,)> = query.build_query_as().fetch_all(&self.pool).await?;
        let ids: Vec<String> = leased.into_iter().map(|(id,)| id).collect();

        debug!(
            kind = E::KIND,
            holder = %ctx.holder,
            requested = limit,
            leased = ids.len(),
            "Leased entities for processing"
        );

        self.load_many(&ids).await
    }

    async fn create(&self, entity: &E) -> Result<()> {
        let row = encode(entity)?;
        sqlx::query(
            r#"
            INSERT INTO state_entities (entity_kind, id, state, state_count, state_timestamp_ms,
                                        created_at_ms, updated_at_ms, error_detail, trace_context, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(E::KIND)
        .bind(&row.id)
        .bind(row.state)
        .bind(row.state_count)
        .bind(row.state_timestamp_ms)
        .bind(row.created_at_ms)
        .bind(row.updated_at_ms)
        .bind(&row.error_detail)
        .bind(&row.trace_context)
        .bind(&row.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &row.id))?;

        Ok(())
    }

    async fn save(&self, entity: &E) -> Result<()> {
        let row = encode(entity)?;
        sqlx::query(
            r#"
            INSERT INTO state_entities (entity_kind, id, state, state_count, state_timestamp_ms,
                                        created_at_ms, updated_at_ms, error_detail, trace_context, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (entity_kind, id) DO UPDATE
            SET state = excluded.state,
                state_count = excluded.state_count,
                state_timestamp_ms = excluded.state_timestamp_ms,
                updated_at_ms = excluded.updated_at_ms,
                error_detail = excluded.error_detail,
                trace_context = excluded.trace_context,
                payload = excluded.payload
            "#,
        )
        .bind(E::KIND)
        .bind(&row.id)
        .bind(row.state)
        .bind(row.state_count)
        .bind(row.state_timestamp_ms)
        .bind(row.created_at_ms)
        .bind(row.updated_at_ms)
        .bind(&row.error_detail)
        .bind(&row.trace_context)
        .bind(&row.payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM state_entities WHERE entity_kind = ?1 AND id = ?2",
        )
        .bind(E::KIND)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(payload,)| decode(&payload)).transpose()
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E> {
        if self.find_by_id(id).await?.is_none() {
            return Err(EngineError::not_found(id));
        }
        self.lease_context.acquire_lease(id).await?;
        self.find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found(id))
    }

    fn lease_context(&self) -> Arc<dyn LeaseContext> {
        self.lease_context.clone()
    }
}
