//! Priority, retry and throttling policy. Pure functions, no I/O.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::TaskStatus;

pub const HIGHEST_PRIORITY: u8 = 1;
pub const LOWEST_PRIORITY: u8 = 10;
pub const MAX_RETRIES_CEILING: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("task priority {0} is outside 1..=10")]
    InvalidPriority(i64),
}

/// Map a task priority (1 highest .. 10 lowest) onto the queue's native
/// priority (0 lowest .. 9 highest).
pub fn queue_priority(task_priority: i64) -> Result<u8, LifecycleError> {
    if !(HIGHEST_PRIORITY as i64..=LOWEST_PRIORITY as i64).contains(&task_priority) {
        return Err(LifecycleError::InvalidPriority(task_priority));
    }
    Ok((10 - task_priority) as u8)
}

/// Clamp a configured retry bound into `0..=10`
pub fn clamp_max_retries(configured: i64) -> u32 {
    configured.clamp(0, MAX_RETRIES_CEILING as i64) as u32
}

/// Retry iff the task failed and `attempt` is below the clamped bound
pub fn should_retry(status: TaskStatus, attempt: u32, max_retries: i64) -> bool {
    status.is_failure() && attempt < clamp_max_retries(max_retries)
}

/// Rate limit on delivering status updates to the pipeline engine.
///
/// Disabled when either field is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Throttle {
    pub max_messages: u64,
    pub period_ms: u64,
}

impl Throttle {
    pub fn new(max_messages: u64, period: Duration) -> Self {
        Self {
            max_messages,
            period_ms: period.as_millis() as u64,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_messages > 0 && self.period_ms > 0
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}
