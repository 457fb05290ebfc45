// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence contract the engine requires from each business domain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::StatefulEntity;
use crate::error::Result;
use crate::lease::LeaseContext;

/// Selection predicate for [`StateEntityStore::next_not_leased`].
///
/// Kept as data rather than a closure so database stores can translate it into
/// the `WHERE` clause of their select-and-lock statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Entities in exactly this state.
    StateIs(i32),
    /// Entities in any of these states.
    StateIn(Vec<i32>),
    /// Every entity of the kind.
    Any,
}

impl Criterion {
    /// Evaluate the predicate against a state code.
    pub fn matches(&self, state: i32) -> bool {
        match self {
            Criterion::StateIs(s) => *s == state,
            Criterion::StateIn(states) => states.contains(&state),
            Criterion::Any => true,
        }
    }

    /// State codes the criterion restricts to, `None` for no restriction.
    pub fn states(&self) -> Option<Vec<i32>> {
        match self {
            Criterion::StateIs(s) => Some(vec![*s]),
            Criterion::StateIn(states) => Some(states.clone()),
            Criterion::Any => None,
        }
    }
}

/// Store for one entity kind.
///
/// Lease handling is explicit: [`save`](Self::save) never touches the lease, the
/// caller breaks it afterwards (or keeps it to continue working on the entity).
#[async_trait]
pub trait StateEntityStore<E: StatefulEntity>: Send + Sync {
    /// Return up to `limit` entities matching `criterion` that have no live lease,
    /// leasing each returned entity for this store's holder in the same atomic
    /// operation. Results are ordered by ascending state timestamp, then id.
    async fn next_not_leased(&self, limit: usize, criterion: &Criterion) -> Result<Vec<E>>;

    /// Insert a new entity. Fails with `EngineError::EntityAlreadyExists` on duplicates.
    async fn create(&self, entity: &E) -> Result<()>;

    /// Persist the entity's current field values (upsert).
    async fn save(&self, entity: &E) -> Result<()>;

    /// Point lookup, no lease side effects.
    async fn find_by_id(&self, id: &str) -> Result<Option<E>>;

    /// Point lookup that also leases the entity for this store's holder.
    ///
    /// Fails with `EngineError::EntityNotFound` or `EngineError::LeaseConflict`.
    async fn find_by_id_and_lease(&self, id: &str) -> Result<E>;

    /// The lease context this store acquires leases with.
    fn lease_context(&self) -> Arc<dyn LeaseContext>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criterion_matches() {
        assert!(Criterion::StateIs(100).matches(100));
        assert!(!Criterion::StateIs(100).matches(200));
        assert!(Criterion::StateIn(vec![100, 300]).matches(300));
        assert!(!Criterion::StateIn(vec![100, 300]).matches(200));
        assert!(Criterion::Any.matches(42));
    }

    #[test]
    fn test_criterion_states() {
        assert_eq!(Criterion::StateIs(100).states(), Some(vec![100]));
        assert_eq!(Criterion::StateIn(vec![1, 2]).states(), Some(vec![1, 2]));
        assert_eq!(Criterion::Any.states(), None);
    }
}
