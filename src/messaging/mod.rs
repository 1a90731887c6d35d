//! Status channel between workers and the pipeline engine
//!
//! Tools report through a [`StatusSender`]; a single delivery loop drains the
//! channel into a [`CallbackHandler`], optionally rate limited by a `tower`
//! `RateLimitLayer` when a [`Throttle`] is configured.

mod delivery;

pub use delivery::{HandlerService, run_delivery};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::task::{ConfigurationError, Task, TaskStatusUpdate, TaskType, Throttle};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("status channel closed")]
    ChannelClosed,

    #[error("invalid callback: {0}")]
    Invalid(#[from] ConfigurationError),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Status update for one delivery of a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCallback {
    /// Queue delivery the update settles
    pub delivery: u64,
    pub task_id: Uuid,
    pub object_id: Option<String>,
    pub task_type: TaskType,
    /// `retry_count` of the delivered task
    pub attempt: u32,
    pub update: TaskStatusUpdate,
}

#[derive(Serialize, Deserialize)]
struct RawCallback {
    delivery: u64,
    task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
    task_type: TaskType,
    #[serde(default)]
    attempt: u32,
    update: Value,
}

impl TaskCallback {
    pub fn new(delivery: u64, task: &Task, update: TaskStatusUpdate) -> Self {
        Self {
            delivery,
            task_id: task.id,
            object_id: task.object_id.clone(),
            task_type: task.task_type(),
            attempt: task.retry_count,
            update,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.update.status.is_terminal()
    }

    pub fn to_json(&self) -> Value {
        let raw = RawCallback {
            delivery: self.delivery,
            task_id: self.task_id,
            object_id: self.object_id.clone(),
            task_type: self.task_type,
            attempt: self.attempt,
            update: self.update.to_json(),
        };
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawCallback = serde_json::from_value(value).map_err(ConfigurationError::from)?;
        let update = TaskStatusUpdate::from_json(raw.task_type, raw.update)?;
        update.check_output(raw.task_type)?;
        Ok(Self {
            delivery: raw.delivery,
            task_id: raw.task_id,
            object_id: raw.object_id,
            task_type: raw.task_type,
            attempt: raw.attempt,
            update,
        })
    }
}

pub type StatusSender = mpsc::Sender<TaskCallback>;
pub type StatusReceiver = mpsc::Receiver<TaskCallback>;

/// Bounded channel carrying [`TaskCallback`]s from tools to delivery
pub fn status_channel(capacity: usize) -> (StatusSender, StatusReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Consumer at the end of the delivery loop
#[async_trait]
pub trait CallbackHandler: Send + Sync + 'static {
    async fn handle(&self, callback: TaskCallback);
}

/// Callbacks handled at once when nothing else is configured
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 8;

/// Delivery settings
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    pub throttle: Throttle,
    /// Callbacks handed to the handler at once; 1 keeps arrival order
    pub concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            throttle: Throttle::default(),
            concurrency: DEFAULT_DELIVERY_CONCURRENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{HashTaskConfiguration, HashTaskOutput, TaskConfiguration, TaskOutput, HashInput};
    use crate::hash::{Hash, HashAlgorithm};
    use serde_json::json;

    fn hash_task() -> Task {
        Task::new(
            "hash",
            TaskConfiguration::Hash(HashTaskConfiguration {
                source: "file:///tmp/a".into(),
                hashes: vec![HashInput::whole(HashAlgorithm::Md5)],
            }),
        )
        .for_object("asset-1")
    }

    #[test]
    fn test_callback_json_round_trip_keeps_output_type() {
        let task = hash_task();
        let output = TaskOutput::Hash(HashTaskOutput {
            hashes: vec![Hash::new(HashAlgorithm::Md5, "d41d8cd98f00b204e9800998ecf8427e")],
        });
        let callback = TaskCallback::new(7, &task, TaskStatusUpdate::completed(Some(output)));

        let decoded = TaskCallback::from_json(callback.to_json()).unwrap();
        assert_eq!(decoded, callback);
        assert_eq!(decoded.object_id.as_deref(), Some("asset-1"));
    }

    #[test]
    fn test_callback_rejects_output_of_other_type() {
        let task = hash_task();
        let value = json!({
            "delivery": 1,
            "task_id": task.id,
            "task_type": "hash",
            "update": {"status": "COMPLETED", "output": {"destination": "file:///x"}}
        });
        assert!(matches!(
            TaskCallback::from_json(value),
            Err(MessagingError::Invalid(_))
        ));
    }
}
