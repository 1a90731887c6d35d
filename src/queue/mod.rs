//! Task queue: persistence, priority ordering, retries and dead letters
//!
//! [`TaskQueue`] is the contract workers and the pipeline engine rely on;
//! [`FjallQueue`] implements it on an embedded LSM store. [`TaskBroker`]
//! sits in front of it, waking idle workers and settling terminal callbacks.

pub mod broker;
pub mod store;

pub use broker::{Settling, TaskBroker};
pub use store::FjallQueue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::{ConfigurationError, LifecycleError, Task, TaskType};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Stored task is invalid: {0}")]
    Task(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Priority(#[from] LifecycleError),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(u64),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A task handed to a consumer, identified by its delivery sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub seq: u64,
    pub task: Task,
}

/// A task that will not be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Task JSON as stored
    pub task: Value,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Priority-ordered, at-least-once task queue.
///
/// A dequeued task stays in flight until acknowledged; unacknowledged
/// deliveries come back after a restart.
pub trait TaskQueue: Send + Sync {
    /// Store `task`, returning its delivery sequence
    fn enqueue(&self, task: &Task) -> Result<u64>;

    /// Highest-priority, oldest task whose type `accept` admits
    fn dequeue(&self, accept: &dyn Fn(TaskType) -> bool) -> Result<Option<Delivery>>;

    /// Settle an in-flight delivery, returning its task if it was in flight
    fn acknowledge(&self, seq: u64) -> Result<Option<Task>>;

    fn dead_letter(&self, seq: u64, task: &Task, reason: &str) -> Result<()>;

    /// Tasks waiting for a consumer
    fn pending(&self) -> Result<usize>;
}

/// Where new tasks are sent; implemented by [`TaskBroker`]
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, task: Task) -> Result<u64>;
}
