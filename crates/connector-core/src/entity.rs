// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted units of long-running business state.
//!
//! Every business entity embeds an [`EntityCore`] and implements
//! [`StatefulEntity`] to expose it. The engine only ever looks at the core:
//! identity, the numeric state code, the consecutive-occupancy counter and the
//! timestamps. What a state code *means* is up to the owning business manager.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Fields shared by every stateful entity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCore {
    /// Unique identifier, immutable after creation.
    pub id: String,
    /// Current state code from the owning domain's enumeration.
    pub state: i32,
    /// Consecutive times the entity has entered `state`.
    pub state_count: i32,
    /// When `state` was last entered.
    pub state_timestamp: DateTime<Utc>,
    /// Creation time, never mutated.
    pub created_at: DateTime<Utc>,
    /// Last time the entity was transitioned or saved through a manager.
    pub updated_at: DateTime<Utc>,
    /// Distributed tracing context carried across processing passes.
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    /// Explanation of the last failure, if any.
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl EntityCore {
    /// Create a core in `initial_state` with a fresh random id.
    pub fn new(initial_state: i32, now: DateTime<Utc>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), initial_state, now)
    }

    /// Create a core with an explicit id.
    pub fn with_id(id: impl Into<String>, initial_state: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state: initial_state,
            state_count: 1,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            trace_context: HashMap::new(),
            error_detail: None,
        }
    }

    /// Move to `state`.
    ///
    /// Re-entering the current state increments `state_count`; entering a different
    /// state resets it to 1. `state_timestamp` is always refreshed and any previous
    /// `error_detail` is cleared.
    pub fn transition_to(&mut self, state: i32, now: DateTime<Utc>) {
        if state == self.state {
            self.state_count = self.state_count.saturating_add(1);
        } else {
            self.state_count = 1;
        }
        self.state = state;
        self.state_timestamp = now;
        self.updated_at = now;
        self.error_detail = None;
    }

    /// Move to `state` and record why.
    pub fn transition_to_error(
        &mut self,
        state: i32,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.transition_to(state, now);
        self.error_detail = Some(detail.into());
    }

    /// Refresh `updated_at` without changing state.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// A persisted entity driven by a state machine.
///
/// `Clone` is the deep copy: every field is owned, so a clone held by a caller
/// never observes mutations made to the store's version.
pub trait StatefulEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Entity kind, used to partition stores and leases (e.g. `"transfer_process"`).
    const KIND: &'static str;

    /// Shared core fields.
    fn core(&self) -> &EntityCore;

    /// Mutable access to the shared core fields.
    fn core_mut(&mut self) -> &mut EntityCore;

    /// Entity id.
    fn id(&self) -> &str {
        &self.core().id
    }

    /// Current state code.
    fn state(&self) -> i32 {
        self.core().state
    }

    /// Consecutive occupancy count of the current state.
    fn state_count(&self) -> i32 {
        self.core().state_count
    }

    /// Last failure explanation.
    fn error_detail(&self) -> Option<&str> {
        self.core().error_detail.as_deref()
    }

    /// See [`EntityCore::transition_to`].
    fn transition_to(&mut self, state: i32, now: DateTime<Utc>) {
        self.core_mut().transition_to(state, now);
    }

    /// See [`EntityCore::transition_to_error`].
    fn transition_to_error(&mut self, state: i32, detail: impl Into<String>, now: DateTime<Utc>) {
        self.core_mut().transition_to_error(state, detail, now);
    }
}
