// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store and lease context.
//!
//! Safe for any number of connector instances sharing one database:
//! - lease grants are a single `INSERT ... ON CONFLICT DO UPDATE ... WHERE expired`
//!   statement, so two holders racing for one entity cannot both win
//! - select-and-lock picks candidates with `FOR UPDATE OF e SKIP LOCKED` and
//!   leases them in the same statement, so concurrent pollers spread out over
//!   the backlog instead of queueing behind each other

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::clock::Clock;
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Lease, LeaseContext, LeaseRetryPolicy, RetryingLeaseContext, duration_millis};
use crate::store::{Criterion, StateEntityStore};

use super::{LeaseRow, decode, encode, map_insert_error, sql_limit};

/// Connect to a PostgreSQL database URL and run migrations.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| EngineError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to PostgreSQL: {}", e),
            transient: false,
        })?;

    crate::migrations::run_postgres(&pool).await?;
    Ok(pool)
}

/// Lease context over the `entity_leases` table.
pub struct PostgresLeaseContext {
    pool: PgPool,
    kind: String,
    holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl PostgresLeaseContext {
    /// Create a lease context for entities of `kind`.
    pub fn new(
        pool: PgPool,
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
impl LeaseContext for PostgresLeaseContext {
    fn holder(&self) -> &str {
        &self.holder
    }

    async fn acquire_lease(&self, entity_id: &str) -> Result<Lease> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            INSERT INTO entity_leases (entity_kind, entity_id, lease_holder, leased_at_ms, lease_duration_ms)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_kind, entity_id) DO UPDATE
            SET lease_holder = EXCLUDED.lease_holder,
                leased_at_ms = EXCLUDED.leased_at_ms,
                lease_duration_ms = EXCLUDED.lease_duration_ms
            WHERE entity_leases.lease_holder = EXCLUDED.lease_holder
               OR entity_leases.leased_at_ms + entity_leases.lease_duration_ms <= EXCLUDED.leased_at_ms
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
            WHERE entity_kind = $1 AND entity_id = $2 AND lease_holder = $3
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
        sqlx::query("DELETE FROM entity_leases WHERE entity_kind = $1 AND entity_id = $2")
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
            WHERE entity_kind = $1 AND entity_id = $2
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
/// Lease operations retry serialization failures and deadlocks through a
/// [`RetryingLeaseContext`].
pub struct PostgresEntityStore<E> {
    pool: PgPool,
    lease_context: Arc<RetryingLeaseContext<PostgresLeaseContext>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatefulEntity> PostgresEntityStore<E> {
    /// Create a store for `E` whose leases are taken on behalf of `holder`.
    pub fn new(
        pool: PgPool,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_lease_retry(pool, holder, lease_duration, clock, LeaseRetryPolicy::default())
    }

    /// Like [`new`](Self::new) with an explicit retry policy for lease operations.
    pub fn with_lease_retry(
        pool: PgPool,
        holder: impl Into<String>,
        lease_duration: Duration,
        clock: Arc<dyn Clock>,
        retry: LeaseRetryPolicy,
    ) -> Self {
        let lease_context = Arc::new(RetryingLeaseContext::new(
            PostgresLeaseContext::new(pool.clone(), E::KIND, holder, lease_duration, clock),
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

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM state_entities
            WHERE entity_kind = $1 AND id = ANY($2)
            ORDER BY state_timestamp_ms ASC, id ASC
            "#,
        )
        .bind(E::KIND)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|(payload,)| decode(payload)).collect()
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for PostgresEntityStore<E> {
    async fn next_not_leased(&self, limit: usize, criterion: &Criterion) -> Result<Vec<E>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ctx = self.lease_context.inner();
        let now_ms = ctx.clock.now_millis();

        let mut query = QueryBuilder::<Postgres>::new(
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
            query.push(" AND e.state = ANY(").push_bind(states).push(")");
        }
        query
            .push(" AND (l.entity_id IS NULL OR l.leased_at_ms + l.lease_duration_ms <= ")
            .push_bind(now_ms)
            .push(") ORDER BY e.state_timestamp_ms ASC, e.id ASC LIMIT ")
            .push_bind(sql_limit(limit))
            .push(
                " FOR UPDATE OF e SKIP LOCKED) AS c \
                 ON CONFLICT (entity_kind, entity_id) DO UPDATE \
                 SET lease_holder = EXCLUDED.lease_holder, \
                     leased_at_ms = EXCLUDED.leased_at_ms, \
                     lease_duration_ms = EXCLUDED.lease_duration_ms \
                 WHERE entity_leases.leased_at_ms + entity_leases.lease_duration_ms <= EXCLUDED.leased_at_ms \
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (entity_kind, id) DO UPDATE
            SET state = EXCLUDED.state,
                state_count = EXCLUDED.state_count,
                state_timestamp_ms = EXCLUDED.state_timestamp_ms,
                updated_at_ms = EXCLUDED.updated_at_ms,
                error_detail = EXCLUDED.error_detail,
                trace_context = EXCLUDED.trace_context,
                payload = EXCLUDED.payload
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
            "SELECT payload FROM state_entities WHERE entity_kind = $1 AND id = $2",
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
