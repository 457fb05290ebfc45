// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for connector-core integration tests.
//!
//! Provides a `Job` entity and pairs of stores (two lease holders sharing one
//! backend) over the in-memory and SQLite backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use connector_core::persistence::{InMemoryBackend, SqliteEntityStore, sqlite};
use connector_core::{Clock, EntityCore, ManualClock, StateEntityStore, StatefulEntity};

pub const STARTED: i32 = 100;
pub const COMPLETED: i32 = 200;

/// Minimal business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub core: EntityCore,
    pub attempts: u32,
}

impl Job {
    pub fn new(id: &str, state: i32, clock: &dyn Clock) -> Self {
        Self {
            core: EntityCore::with_id(id, state, clock.now()),
            attempts: 0,
        }
    }
}

impl StatefulEntity for Job {
    const KIND: &'static str = "job";

    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub const BACKENDS: [Backend; 2] = [Backend::Memory, Backend::Sqlite];

/// Two holders ("node-a", "node-b") sharing one backend and one manual clock.
pub struct Holders {
    pub a: Arc<dyn StateEntityStore<Job>>,
    pub b: Arc<dyn StateEntityStore<Job>>,
    pub clock: Arc<ManualClock>,
    _dir: Option<TempDir>,
}

impl Holders {
    pub async fn new(backend: Backend, lease_duration: Duration) -> Self {
        let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
        match backend {
            Backend::Memory => {
                let shared = InMemoryBackend::<Job>::new();
                Self {
                    a: Arc::new(shared.store("node-a", lease_duration, clock.clone())),
                    b: Arc::new(shared.store("node-b", lease_duration, clock.clone())),
                    clock,
                    _dir: None,
                }
            }
            Backend::Sqlite => {
                let dir = tempfile::tempdir().expect("temp dir");
                let pool = sqlite::from_path(dir.path().join("connector.db"))
                    .await
                    .expect("sqlite pool");
                Self {
                    a: Arc::new(SqliteEntityStore::<Job>::new(
                        pool.clone(),
                        "node-a",
                        lease_duration,
                        clock.clone(),
                    )),
                    b: Arc::new(SqliteEntityStore::<Job>::new(
                        pool,
                        "node-b",
                        lease_duration,
                        clock.clone(),
                    )),
                    clock,
                    _dir: Some(dir),
                }
            }
        }
    }

    /// Insert `count` jobs in `state`, one millisecond apart, ids `{prefix}-{i}`.
    pub async fn seed(&self, prefix: &str, count: usize, state: i32) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("{}-{}", prefix, i);
            self.a
                .create(&Job::new(&id, state, self.clock.as_ref()))
                .await
                .expect("create job");
            self.clock.advance(Duration::from_millis(1));
            ids.push(id);
        }
        ids
    }
}

pub fn ids(jobs: &[Job]) -> Vec<String> {
    jobs.iter().map(|j| j.id().to_string()).collect()
}
