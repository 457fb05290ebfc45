// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle back-off between state machine iterations.

use std::time::Duration;

/// Computes how long the loop sleeps after an iteration that did no work.
pub trait WaitStrategy: Send {
    /// Delay before the next iteration, in milliseconds. Called once per idle iteration.
    fn wait_for_millis(&mut self) -> u64;

    /// Called after an iteration that did work; resets any accumulated back-off.
    fn success(&mut self) {}
}

/// Back-off that grows by `multiplier` on each consecutive idle iteration.
///
/// The first idle wait is `min`, the next `min * multiplier`, and so on up to
/// `max`. [`WaitStrategy::success`] drops back to `min`.
#[derive(Debug, Clone)]
pub struct ExponentialWaitStrategy {
    min_ms: u64,
    max_ms: u64,
    multiplier: u32,
    idle_iterations: u32,
}

impl ExponentialWaitStrategy {
    /// Create a strategy. `max` is raised to `min` and `multiplier` to 1 if smaller.
    pub fn new(min: Duration, max: Duration, multiplier: u32) -> Self {
        let min_ms = duration_to_millis(min);
        Self {
            min_ms,
            max_ms: duration_to_millis(max).max(min_ms),
            multiplier: multiplier.max(1),
            idle_iterations: 0,
        }
    }

    fn delay(&self, step: u32) -> u64 {
        let factor = u64::from(self.multiplier).saturating_pow(step);
        self.min_ms.saturating_mul(factor).min(self.max_ms)
    }
}

impl Default for ExponentialWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2)
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for_millis(&mut self) -> u64 {
        let wait = self.delay(self.idle_iterations);
        self.idle_iterations = self.idle_iterations.saturating_add(1);
        wait
    }

    fn success(&mut self) {
        self.idle_iterations = 0;
    }
}

/// Constant wait, regardless of history.
#[derive(Debug, Clone)]
pub struct FixedWaitStrategy {
    millis: u64,
}

impl FixedWaitStrategy {
    /// Always wait `wait`.
    pub fn new(wait: Duration) -> Self {
        Self {
            millis: duration_to_millis(wait),
        }
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for_millis(&mut self) -> u64 {
        self.millis
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
