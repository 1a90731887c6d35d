//! Tasks, their typed configurations and outputs, and status updates
//!
//! A [`Task`] is the unit of work that travels through the queue. Its
//! configuration and any output are sum types keyed by [`TaskType`], the same
//! tag used on the wire (`task_type`) and as the tool name in the worker
//! registry.

mod config;
pub mod lifecycle;

pub use config::{
    AwsUploadPart, AwsUploadTaskConfiguration, ContentInfo, DeleteTaskConfiguration,
    GlacierUploadTaskOutput, HashInput, HashTaskConfiguration, HashTaskOutput,
    ManifestFile, ManifestParseTaskConfiguration, ManifestParseTaskOutput, RestoreTaskConfiguration,
    RestoreTaskOutput, S3Part, S3UploadTaskOutput, TaskConfiguration, TaskOutput,
    TransferInstruction, TransferTaskConfiguration, TransferTaskOutput,
};
pub use lifecycle::{LifecycleError, Throttle, clamp_max_retries, queue_priority, should_retry};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Default priority for tasks that do not ask for one (1 is highest)
pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid URI in `{field}` ({value}): {reason}")]
    InvalidUri {
        field: String,
        value: String,
        reason: String,
    },

    #[error("{found} payload supplied for a {expected} task")]
    TypeMismatch { expected: TaskType, found: TaskType },

    #[error("malformed JSON: {0}")]
    Json(String),
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigurationError {
    fn from(error: serde_json::Error) -> Self {
        let message = error.to_string();
        // serde reports absent fields as "missing field `name`"
        if let Some(rest) = message.strip_prefix("missing field `") {
            if let Some(end) = rest.find('`') {
                return ConfigurationError::MissingField(rest[..end].to_string());
            }
        }
        ConfigurationError::Json(message)
    }
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

/// Task type tag; doubles as the tool name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Delete,
    Hash,
    Transfer,
    S3Upload,
    GlacierUpload,
    Restore,
    ManifestParse,
}

impl TaskType {
    pub const ALL: [TaskType; 7] = [
        TaskType::Delete,
        TaskType::Hash,
        TaskType::Transfer,
        TaskType::S3Upload,
        TaskType::GlacierUpload,
        TaskType::Restore,
        TaskType::ManifestParse,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskType::Delete => "delete",
            TaskType::Hash => "hash",
            TaskType::Transfer => "transfer",
            TaskType::S3Upload => "s3_upload",
            TaskType::GlacierUpload => "glacier_upload",
            TaskType::Restore => "restore",
            TaskType::ManifestParse => "manifest_parse",
        }
    }
}

impl FromStr for TaskType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigurationError::invalid("task_type", format!("unknown task type `{}`", s)))
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Executing,
    Completed,
    FailedClean,
    FailedDirty,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::FailedClean | TaskStatus::FailedDirty
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::FailedClean | TaskStatus::FailedDirty)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::FailedClean => "FAILED_CLEAN",
            TaskStatus::FailedDirty => "FAILED_DIRTY",
        };
        f.write_str(name)
    }
}

/// One dispatchable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask", into = "RawTask")]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    /// Pipeline object the task's callbacks are routed to
    pub object_id: Option<String>,
    /// 1 (highest) ..= 10 (lowest)
    pub priority: u8,
    /// Attempt number, 0 on first delivery
    pub retry_count: u32,
    pub configuration: TaskConfiguration,
}

impl Task {
    pub fn new(name: impl Into<String>, configuration: TaskConfiguration) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            object_id: None,
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
            configuration,
        }
    }

    pub fn for_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Result<Self> {
        check_priority(priority)?;
        self.priority = priority;
        Ok(self)
    }

    pub fn task_type(&self) -> TaskType {
        self.configuration.task_type()
    }

    /// Fresh delivery of the same logical task with the attempt count bumped
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawTask = serde_json::from_str(json)?;
        Task::try_from(raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn check_priority(priority: u8) -> Result<()> {
    if (lifecycle::HIGHEST_PRIORITY..=lifecycle::LOWEST_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(ConfigurationError::invalid(
            "priority",
            format!("{} is outside 1..=10", priority),
        ))
    }
}

#[derive(Serialize, Deserialize)]
struct RawTask {
    id: Uuid,
    task_type: TaskType,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    retry_count: u32,
    configuration: Value,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl TryFrom<RawTask> for Task {
    type Error = ConfigurationError;

    fn try_from(raw: RawTask) -> Result<Self> {
        check_priority(raw.priority)?;
        let configuration = TaskConfiguration::from_json(raw.task_type, raw.configuration)?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            object_id: raw.object_id,
            priority: raw.priority,
            retry_count: raw.retry_count,
            configuration,
        })
    }
}

impl From<Task> for RawTask {
    fn from(task: Task) -> Self {
        RawTask {
            id: task.id,
            task_type: task.task_type(),
            name: task.name,
            object_id: task.object_id,
            priority: task.priority,
            retry_count: task.retry_count,
            configuration: task.configuration.to_json(),
        }
    }
}

/// Outcome (or progress) of executing a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub status: TaskStatus,
    pub message: Option<String>,
    /// 1..=100; zero is treated as absent
    pub percent_complete: Option<u8>,
    pub output: Option<TaskOutput>,
}

impl TaskStatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            message: None,
            percent_complete: None,
            output: None,
        }
    }

    pub fn completed(output: Option<TaskOutput>) -> Self {
        Self {
            output,
            ..Self::new(TaskStatus::Completed)
        }
    }

    pub fn failed_clean(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::FailedClean).with_message(message)
    }

    pub fn failed_dirty(message: impl Into<String>) -> Self {
        Self::new(TaskStatus::FailedDirty).with_message(message)
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            percent_complete: (percent > 0).then_some(percent.min(100)),
            ..Self::new(TaskStatus::Executing)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("status".into(), serde_json::json!(self.status));
        if let Some(message) = &self.message {
            object.insert("message".into(), Value::String(message.clone()));
        }
        if let Some(percent) = self.percent_complete.filter(|p| *p > 0) {
            object.insert("percent_complete".into(), Value::from(percent));
        }
        if let Some(output) = &self.output {
            object.insert("output".into(), output.to_json());
        }
        Value::Object(object)
    }

    /// Decode an update for a task of `task_type`; the output shape is
    /// chosen by the task type.
    pub fn from_json(task_type: TaskType, value: Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawUpdate {
            status: TaskStatus,
            #[serde(default)]
            message: Option<String>,
            #[serde(default)]
            percent_complete: Option<u8>,
            #[serde(default)]
            output: Option<Value>,
        }

        let raw: RawUpdate = serde_json::from_value(value)?;
        let output = match raw.output {
            Some(Value::Null) | None => None,
            Some(value) => Some(TaskOutput::from_json(task_type, value)?),
        };

        Ok(Self {
            status: raw.status,
            message: raw.message,
            percent_complete: raw.percent_complete.filter(|p| *p > 0),
            output,
        })
    }

    /// Check that any output matches the task type
    pub fn check_output(&self, task_type: TaskType) -> Result<()> {
        match self.output.as_ref().map(TaskOutput::task_type) {
            Some(found) if found != task_type => Err(ConfigurationError::TypeMismatch {
                expected: task_type,
                found,
            }),
            _ => Ok(()),
        }
    }
}
