// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end processing loop tests: managers, processors and stores together.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{BACKENDS, COMPLETED, Holders, Job, STARTED};
use connector_core::{
    Clock, Criterion, EngineError, EntityManagerConfig, FixedWaitStrategy, StateEntityManager,
    StateEntityStore, StatefulEntity,
};

const LEASE: Duration = Duration::from_secs(30);

type Counts = Arc<Mutex<HashMap<String, usize>>>;

fn manager(
    name: &str,
    store: Arc<dyn StateEntityStore<Job>>,
    clock: Arc<dyn Clock>,
) -> Arc<StateEntityManager<Job>> {
    let config = EntityManagerConfig {
        batch_size: 3,
        lease_duration: LEASE,
        ..Default::default()
    };
    Arc::new(StateEntityManager::new(name, store, clock, config))
}

/// Start `manager` with a STARTED -> COMPLETED processor that counts invocations.
fn start_completing(manager: &Arc<StateEntityManager<Job>>, counts: Counts, fail_id: Option<&str>) {
    let inner = manager.clone();
    let fail_id = fail_id.map(str::to_string);
    let processor = manager.processor_for_state("started", STARTED, move |mut job: Job| {
        let manager = inner.clone();
        let counts = counts.clone();
        let fail_id = fail_id.clone();
        async move {
            *counts.lock().unwrap().entry(job.id().to_string()).or_default() += 1;
            if fail_id.as_deref() == Some(job.id()) {
                return Err(EngineError::Processing {
                    entity_id: job.id().to_string(),
                    reason: "downstream rejected".to_string(),
                });
            }
            job.transition_to(COMPLETED, manager.clock().now());
            manager.update(&mut job).await?;
            Ok(true)
        }
    });

    manager
        .start_with(
            vec![Box::new(processor)],
            Box::new(FixedWaitStrategy::new(Duration::from_millis(5))),
        )
        .unwrap();
}

async fn count_in_state(store: &Arc<dyn StateEntityStore<Job>>, ids: &[String], state: i32) -> usize {
    let mut count = 0;
    for id in ids {
        if let Some(job) = store.find_by_id(id).await.unwrap()
            && job.state() == state
        {
            count += 1;
        }
    }
    count
}

async fn wait_for_completed(store: &Arc<dyn StateEntityStore<Job>>, ids: &[String], expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while count_in_state(store, ids, COMPLETED).await < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} completed entities",
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_drains_backlog() {
    for backend in BACKENDS {
        let h = Holders::new(backend, LEASE).await;
        let ids = h.seed("job", 10, STARTED).await;
        let counts: Counts = Arc::default();

        let m = manager("drain", h.a.clone(), h.clock.clone());
        start_completing(&m, counts.clone(), None);
        wait_for_completed(&h.a, &ids, ids.len()).await;
        m.stop().await.unwrap();
        assert!(!m.is_running());

        let counts = counts.lock().unwrap();
        assert_eq!(counts.len(), ids.len(), "{:?}", backend);
        assert!(counts.values().all(|&c| c == 1), "{:?}: {:?}", backend, counts);
        for id in &ids {
            assert!(h.a.lease_context().get_lease(id).await.unwrap().is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_instances_process_each_entity_once() {
    for backend in BACKENDS {
        let h = Holders::new(backend, LEASE).await;
        let ids = h.seed("job", 30, STARTED).await;
        let counts: Counts = Arc::default();

        let a = manager("instance-a", h.a.clone(), h.clock.clone());
        let b = manager("instance-b", h.b.clone(), h.clock.clone());
        start_completing(&a, counts.clone(), None);
        start_completing(&b, counts.clone(), None);

        wait_for_completed(&h.a, &ids, ids.len()).await;
        a.stop().await.unwrap();
        b.stop().await.unwrap();

        let counts = counts.lock().unwrap();
        assert_eq!(counts.len(), ids.len(), "{:?}", backend);
        assert!(
            counts.values().all(|&c| c == 1),
            "{:?}: entity processed more than once: {:?}",
            backend,
            counts
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_entity_does_not_halt_processing() {
    for backend in BACKENDS {
        let h = Holders::new(backend, LEASE).await;
        let ids = h.seed("job", 5, STARTED).await;
        let counts: Counts = Arc::default();

        let m = manager("failing", h.a.clone(), h.clock.clone());
        start_completing(&m, counts.clone(), Some("job-0"));
        wait_for_completed(&h.a, &ids, 4).await;

        // the failing entity is released and retried on later iterations
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while counts.lock().unwrap().get("job-0").copied().unwrap_or(0) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "failing entity not retried");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        m.stop().await.unwrap();

        let job = h.a.find_by_id("job-0").await.unwrap().unwrap();
        assert_eq!(job.state(), STARTED, "{:?}", backend);
        assert!(h.a.lease_context().get_lease("job-0").await.unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_holder_work_is_recovered_after_expiry() {
    for backend in BACKENDS {
        let h = Holders::new(backend, LEASE).await;
        let ids = h.seed("job", 4, STARTED).await;

        // node-a leases the whole backlog and never comes back
        let taken = h.a.next_not_leased(10, &Criterion::StateIs(STARTED)).await.unwrap();
        assert_eq!(taken.len(), ids.len());

        let counts: Counts = Arc::default();
        let b = manager("survivor", h.b.clone(), h.clock.clone());
        start_completing(&b, counts.clone(), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counts.lock().unwrap().is_empty(), "{:?}: leased work was taken early", backend);

        h.clock.advance(LEASE);
        wait_for_completed(&h.b, &ids, ids.len()).await;
        b.stop().await.unwrap();
    }
}
