// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The processing loop.
//!
//! [`StateMachineManager`] owns a background tokio task that repeatedly invokes
//! every registered [`Processor`]. An iteration that advanced at least one
//! entity is followed immediately by the next one; an idle iteration sleeps for
//! [`WaitStrategy::wait_for_millis`]. The stop signal is observed between
//! iterations and during the idle sleep, never in the middle of processing.
//!
//! ```text
//!   start() ──► loop {
//!                 processed = Σ processor.process()
//!                 processed > 0 ? wait.success()
//!                               : sleep(wait.wait_for_millis()) or stop
//!               } ◄── stop()
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::processor::Processor;
use crate::wait::WaitStrategy;

/// Static settings of a state machine loop.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Name used in logs and errors (e.g. `"transfer-process"`).
    pub name: String,
}

impl StateMachineConfig {
    /// Config for a loop called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

struct LoopState {
    name: String,
    processors: Vec<Box<dyn Processor>>,
    wait_strategy: Mutex<Box<dyn WaitStrategy>>,
}

impl LoopState {
    async fn run_iteration(&self) -> usize {
        let mut processed = 0;
        for processor in &self.processors {
            let count = processor.process().await;
            if count > 0 {
                debug!(
                    state_machine = %self.name,
                    processor = processor.name(),
                    processed = count,
                    "Processor advanced entities"
                );
            }
            processed += count;
        }
        processed
    }

    fn wait_strategy(&self) -> std::sync::MutexGuard<'_, Box<dyn WaitStrategy>> {
        self.wait_strategy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runnable loop over a fixed set of processors.
pub struct StateMachineManager {
    state: Arc<LoopState>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for StateMachineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineManager")
            .field("name", &self.state.name)
            .field("processors", &self.state.processors.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl StateMachineManager {
    /// Create a stopped manager.
    pub fn new(
        config: StateMachineConfig,
        processors: Vec<Box<dyn Processor>>,
        wait_strategy: Box<dyn WaitStrategy>,
    ) -> Self {
        Self {
            state: Arc::new(LoopState {
                name: config.name,
                processors,
                wait_strategy: Mutex::new(wait_strategy),
            }),
            running: Mutex::new(None),
        }
    }

    /// Loop name from the config.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// Fails with `EngineError::AlreadyRunning` if the loop is already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if let Some(current) = running.as_ref()
            && !current.handle.is_finished()
        {
            return Err(EngineError::AlreadyRunning(self.state.name.clone()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.state.clone(), shutdown_rx));
        *running = Some(Running {
            shutdown_tx,
            handle,
        });

        info!(
            state_machine = %self.state.name,
            processors = self.state.processors.len(),
            "State machine started"
        );
        Ok(())
    }

    /// Signal the loop to stop and wait for the current iteration to finish.
    ///
    /// No-op when the loop is not running.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.lock_running().take() else {
            return Ok(());
        };

        info!(state_machine = %self.state.name, "State machine stopping...");
        let _ = running.shutdown_tx.send(true);

        match running.handle.await {
            Ok(()) => {
                info!(state_machine = %self.state.name, "State machine stopped");
                Ok(())
            }
            Err(e) => {
                error!(state_machine = %self.state.name, error = %e, "State machine task failed");
                Err(e.into())
            }
        }
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    /// Run a single iteration on the caller's task and return the number of
    /// entities advanced. Does not consult the wait strategy.
    pub async fn run_iteration(&self) -> usize {
        self.state.run_iteration().await
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_loop(state: Arc<LoopState>, mut shutdown_rx: watch::Receiver<bool>) {
    if state.processors.is_empty() {
        info!(state_machine = %state.name, "No processors registered, idling");
    }

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let processed = state.run_iteration().await;
        if processed > 0 {
            state.wait_strategy().success();
            tokio::task::yield_now().await;
            continue;
        }

        let wait_ms = state.wait_strategy().wait_for_millis();
        debug!(state_machine = %state.name, wait_ms, "Idle iteration, backing off");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // Manager dropped without stop()
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::FixedWaitStrategy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns scripted results, then 0 forever.
    struct ScriptedProcessor {
        script: Mutex<VecDeque<usize>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProcessor {
        fn new(script: &[usize], calls: Arc<AtomicUsize>) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls,
            }
        }
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn process(&self) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(0)
        }
    }

    /// Records wait-strategy interactions.
    struct RecordingWait {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl WaitStrategy for RecordingWait {
        fn wait_for_millis(&mut self) -> u64 {
            self.events.lock().unwrap().push("wait");
            100
        }

        fn success(&mut self) {
            self.events.lock().unwrap().push("success");
        }
    }

    fn fixed(ms: u64) -> Box<dyn WaitStrategy> {
        Box::new(FixedWaitStrategy::new(Duration::from_millis(ms)))
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_restart_works() {
        let manager = StateMachineManager::new(StateMachineConfig::new("test"), vec![], fixed(10));
        assert!(!manager.is_running());

        manager.start().unwrap();
        assert!(manager.is_running());
        let err = manager.start().unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(ref name) if name == "test"));

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        // stopping a stopped manager is a no-op
        manager.stop().await.unwrap();

        manager.start().unwrap();
        assert!(manager.is_running());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_iteration_sums_processors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = StateMachineManager::new(
            StateMachineConfig::new("test"),
            vec![
                Box::new(ScriptedProcessor::new(&[2], calls.clone())),
                Box::new(ScriptedProcessor::new(&[3], calls.clone())),
            ],
            fixed(10),
        );

        assert_eq!(manager.run_iteration().await, 5);
        assert_eq!(manager.run_iteration().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_only_after_idle_iterations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let manager = StateMachineManager::new(
            StateMachineConfig::new("test"),
            vec![Box::new(ScriptedProcessor::new(&[0, 0, 1, 1, 0], calls.clone()))],
            Box::new(RecordingWait {
                events: events.clone(),
            }),
        );

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        manager.stop().await.unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(&events[..5], &["wait", "wait", "success", "success", "wait"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_heartbeat_without_processors() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let manager = StateMachineManager::new(
            StateMachineConfig::new("idle"),
            vec![],
            Box::new(RecordingWait {
                events: events.clone(),
            }),
        );

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        manager.stop().await.unwrap();

        let events = events.lock().unwrap();
        assert!(events.len() >= 3);
        assert!(events.iter().all(|e| *e == "wait"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_idle_sleep() {
        let manager = StateMachineManager::new(
            StateMachineConfig::new("test"),
            vec![],
            fixed(3_600_000),
        );
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), manager.stop())
            .await
            .expect("stop should not wait for the idle sleep")
            .unwrap();
    }

    /// Sleeps inside `process` to simulate a slow entity.
    struct SlowProcessor {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor for SlowProcessor {
        fn name(&self) -> &str {
            "slow"
        }

        async fn process(&self) -> usize {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_iteration() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let manager = StateMachineManager::new(
            StateMachineConfig::new("test"),
            vec![Box::new(SlowProcessor {
                started: started.clone(),
                finished: finished.clone(),
            })],
            fixed(10),
        );

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop().await.unwrap();

        assert!(started.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            started.load(Ordering::SeqCst),
            finished.load(Ordering::SeqCst)
        );
    }
}
