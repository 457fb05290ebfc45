// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-boxed exclusive claims on entities.
//!
//! A lease is the only admission control the engine has: an entity with a live
//! lease held by someone else is never handed out for processing. Leases are
//! granted and released through a [`LeaseContext`], which every backend must
//! implement as a single atomic conditional write. A lease that is never broken
//! (its holder crashed) becomes reclaimable once `leased_at + lease_duration`
//! has passed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::Result;

/// Exclusive claim on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The leased entity.
    pub entity_id: String,
    /// Identity of the holder (typically the runtime id).
    pub lease_holder: String,
    /// When the lease was granted.
    pub leased_at: DateTime<Utc>,
    /// Validity window.
    pub lease_duration: Duration,
}

impl Lease {
    /// Instant at which the lease stops protecting the entity.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.leased_at + chrono::Duration::milliseconds(duration_millis(self.lease_duration))
    }

    /// Whether the lease can be reclaimed by another holder at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Whether `holder` owns this lease.
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.lease_holder == holder
    }
}

/// Lease duration as stored in the database.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Atomic, store-level mutual exclusion on single entities.
///
/// Implementations keep no in-memory state between calls, so one context can be
/// shared across tasks and any number of processes can use the same backing store.
#[async_trait]
pub trait LeaseContext: Send + Sync {
    /// Identity written into every lease this context grants.
    fn holder(&self) -> &str;

    /// Claim `entity_id` for this context's holder.
    ///
    /// Succeeds when no lease exists, the existing lease has expired, or it is
    /// already held by this holder (in which case it is renewed). Fails with
    /// `EngineError::LeaseConflict` when another holder owns a live lease.
    async fn acquire_lease(&self, entity_id: &str) -> Result<Lease>;

    /// Release `entity_id` if this holder owns the lease.
    ///
    /// No-op when no lease exists. Fails with `EngineError::LeaseConflict` when a
    /// live lease belongs to another holder.
    async fn break_lease(&self, entity_id: &str) -> Result<()>;

    /// Release `entity_id` regardless of who holds it.
    async fn force_break_lease(&self, entity_id: &str) -> Result<()>;

    /// Current lease record, expired or not.
    async fn get_lease(&self, entity_id: &str) -> Result<Option<Lease>>;
}

/// Bounded retry for transient lease storage failures.
#[derive(Debug, Clone)]
pub struct LeaseRetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further one.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for LeaseRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl LeaseRetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Wraps a [`LeaseContext`] and retries transient storage errors.
///
/// Lease conflicts and permanent failures are returned immediately.
pub struct RetryingLeaseContext<L> {
    inner: L,
    policy: LeaseRetryPolicy,
}

impl<L: LeaseContext> RetryingLeaseContext<L> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: L, policy: LeaseRetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped context.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, entity_id: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        entity_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient lease storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(operation, entity_id, attempt, error = %e, "Lease operation failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl<L: LeaseContext> LeaseContext for RetryingLeaseContext<L> {
    fn holder(&self) -> &str {
        self.inner.holder()
    }

    async fn acquire_lease(&self, entity_id: &str) -> Result<Lease> {
        self.with_retry("acquire_lease", entity_id, || {
            self.inner.acquire_lease(entity_id)
        })
        .await
    }

    async fn break_lease(&self, entity_id: &str) -> Result<()> {
        self.with_retry("break_lease", entity_id, || self.inner.break_lease(entity_id))
            .await
    }

    async fn force_break_lease(&self, entity_id: &str) -> Result<()> {
        self.with_retry("force_break_lease", entity_id, || {
            self.inner.force_break_lease(entity_id)
        })
        .await
    }

    async fn get_lease(&self, entity_id: &str) -> Result<Option<Lease>> {
        self.with_retry("get_lease", entity_id, || self.inner.get_lease(entity_id))
            .await
    }
}
