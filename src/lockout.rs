//! Lockout scheduling with exponential backoff.
//!
//! Lockout windows are absolute wall-clock deadlines. The countdown always
//! recomputes the remaining time from the clock, so a host that was
//! suspended picks up the correct remaining time when it resumes.

use crate::clock::Clock;
use crate::config::LockoutConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A computed lockout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockout {
    pub duration_ms: u64,
    /// Epoch milliseconds at which the lockout ends
    pub blocked_until: u64,
}

/// Computes lockout windows and drives countdowns.
pub struct BlockScheduler {
    base_ms: u64,
    max_ms: Option<u64>,
    tick: Duration,
    clock: Arc<dyn Clock>,
}

impl BlockScheduler {
    pub fn new(config: &LockoutConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_ms: config.base_ms.max(1),
            max_ms: config.max_ms,
            tick: Duration::from_millis(config.tick_ms.max(1)),
            clock,
        }
    }

    /// `base * 2^(block_count - 1)`, saturating, clamped to the ceiling.
    ///
    /// A count of zero is treated as the first block.
    pub fn lockout_duration(&self, block_count: u32) -> u64 {
        let exponent = block_count.max(1) - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let duration = self.base_ms.saturating_mul(factor);
        match self.max_ms {
            Some(max) => duration.min(max.max(1)),
            None => duration,
        }
    }

    /// Lockout window for the given block count starting at `now_ms`.
    pub fn compute_lockout(&self, block_count: u32, now_ms: u64) -> Lockout {
        let duration_ms = self.lockout_duration(block_count);
        Lockout {
            duration_ms,
            blocked_until: now_ms.saturating_add(duration_ms),
        }
    }

    pub fn remaining_ms(&self, blocked_until: u64) -> u64 {
        blocked_until.saturating_sub(self.clock.now_ms())
    }

    pub fn is_expired(&self, blocked_until: u64) -> bool {
        self.remaining_ms(blocked_until) == 0
    }

    /// Count down to `blocked_until`, reporting the remaining time on every
    /// tick. Returns once the deadline has passed on the wall clock.
    pub async fn countdown<F>(&self, blocked_until: u64, mut on_tick: F)
    where
        F: FnMut(u64),
    {
        loop {
            let remaining = self.remaining_ms(blocked_until);
            if remaining == 0 {
                debug!(blocked_until, "Lockout window elapsed");
                return;
            }
            on_tick(remaining);
            tokio::time::sleep(self.tick.min(Duration::from_millis(remaining))).await;
        }
    }
}
