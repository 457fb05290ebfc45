// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity-level retry and terminal-failure policies.
//!
//! A processing function that fails does not decide ad hoc whether to retry:
//! every transition that can fail is given a [`FailurePolicy`]. `Retry` re-enters
//! the current state (so `state_count` grows) until the retry limit is reached,
//! `Terminate` moves straight to the terminal state. Both record `error_detail`.
//!
//! Retried entities are spaced out with [`EntityRetryPolicy::should_delay`]:
//! processors check it first and release entities whose back-off has not elapsed.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::entity::StatefulEntity;

/// Retry limit and back-off for entities that re-enter a state after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRetryPolicy {
    /// Retries allowed after the first attempt in a state.
    pub retry_limit: u32,
    /// Delay before the first retry; doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for a single retry delay.
    pub max_delay: Duration,
}

impl Default for EntityRetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 7,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl EntityRetryPolicy {
    /// Delay before the `retry`-th retry (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether the entity is still inside its retry back-off window at `now`.
    ///
    /// An entity on its first attempt in a state (`state_count == 1`) is never delayed.
    pub fn should_delay<E: StatefulEntity>(&self, entity: &E, now: DateTime<Utc>) -> bool {
        let retries = entity.state_count().saturating_sub(1);
        if retries <= 0 {
            return false;
        }
        let delay = self.delay_for(retries as u32);
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        match entity.core().state_timestamp.checked_add_signed(delay) {
            Some(ready_at) => ready_at > now,
            None => true,
        }
    }

    /// Whether the entity has used up its retries in the current state.
    pub fn retries_exhausted<E: StatefulEntity>(&self, entity: &E) -> bool {
        i64::from(entity.state_count()) > i64::from(self.retry_limit)
    }
}

/// What to do when a transition out of the current state fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Re-enter the current state until retries are exhausted, then terminate.
    Retry(EntityRetryPolicy),
    /// Go straight to the terminal state.
    Terminate,
}

/// Result of applying a [`FailurePolicy`] to a failed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The entity stays in (re-enters) its current state.
    RetrySameState,
    /// The entity moves to the terminal state.
    Terminate,
}

impl FailurePolicy {
    /// Decide the outcome for an entity whose current attempt just failed.
    pub fn decide<E: StatefulEntity>(&self, entity: &E) -> FailureOutcome {
        match self {
            FailurePolicy::Retry(policy) if !policy.retries_exhausted(entity) => {
                FailureOutcome::RetrySameState
            }
            _ => FailureOutcome::Terminate,
        }
    }

    /// Decide and apply the transition, recording `detail` as the error.
    pub fn apply<E: StatefulEntity>(
        &self,
        entity: &mut E,
        terminal_state: i32,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let outcome = self.decide(entity);
        let state = match outcome {
            FailureOutcome::RetrySameState => entity.state(),
            FailureOutcome::Terminate => terminal_state,
        };
        entity.transition_to_error(state, detail, now);
        outcome
    }
}
