//! Retry policy: decides whether a failed task may go back to pending.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{GuardViolation, Task, TaskStatus};

/// Retry policy for failed tasks.
///
/// - `max_attempts` bounds the number of failures a task may accumulate
///   before retries stop.
/// - The backoff after the n-th failure is `base_delay * multiplier^(n - 1)`,
///   capped at `max_delay`, counted from the failure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, at most `max_attempts` failures.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the retry that follows the `failures`-th failure.
    ///
    /// Example with base=2s, multiplier=2.0:
    /// - failure 1: 2s
    /// - failure 2: 4s
    /// - failure 3: 8s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let base_secs = Duration::from_millis(self.base_delay_ms).as_secs_f64();
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        let max = Duration::from_millis(self.max_delay_ms);
        if !delay_secs.is_finite() || delay_secs >= max.as_secs_f64() {
            return max;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Earliest time `task` may be requeued, or None once the budget is spent.
    pub fn retry_at(&self, task: &Task) -> Option<DateTime<Utc>> {
        if task.failures >= self.max_attempts {
            return None;
        }
        let failed_at = task.completed_at.unwrap_or(task.created_at);
        let delay = TimeDelta::from_std(self.next_delay(task.failures)).ok()?;
        failed_at.checked_add_signed(delay)
    }

    /// Guard for `failed -> pending`.
    pub fn check(&self, task: &Task, now: DateTime<Utc>) -> Result<(), GuardViolation> {
        if task.status != TaskStatus::Failed {
            return Err(GuardViolation::NotAllowed);
        }
        match self.retry_at(task) {
            None => Err(GuardViolation::RetryExhausted {
                failures: task.failures,
            }),
            Some(at) if at > now => Err(GuardViolation::BackoffPending(at)),
            Some(_) => Ok(()),
        }
    }
}
