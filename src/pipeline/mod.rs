//! Server-side pipelines: ordered stages driven by task callbacks
//!
//! A pipeline belongs to one object id and owns an ordered list of stage
//! names; the head of the list is the current stage. Stages are stateless
//! [`PipelineStage`] implementations looked up by name in a
//! [`StageRegistry`]; everything they need to remember lives in the
//! [`PipelineContext`], which the engine persists as a
//! [`JobRecord`](crate::ledger::JobRecord) on every transition.

mod engine;
pub mod stages;

pub use engine::{PipelineEngine, PipelineEvent};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::messaging::TaskCallback;
use crate::queue::{QueueError, TaskDispatcher};
use crate::task::Task;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("a pipeline for object `{0}` is already active")]
    DuplicatePipeline(String),

    #[error("pipeline for object `{0}` has no stages")]
    EmptyPipeline(String),

    #[error("stage data `{key}` is invalid: {source}")]
    Data {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to dispatch task: {0}")]
    Dispatch(#[from] QueueError),

    #[error("failed to store pipeline: {0}")]
    Store(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Current stage's `prepare` is running
    Preparing,
    /// Tasks dispatched by the current stage are outstanding
    AwaitingCallback,
    /// Current stage finished, moving to the next
    Advancing,
    Completed,
    /// A stage failed and the failure stage is running
    Failing,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Preparing => "preparing",
            PipelineState::AwaitingCallback => "awaiting_callback",
            PipelineState::Advancing => "advancing",
            PipelineState::Completed => "completed",
            PipelineState::Failing => "failing",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a stage asks the engine to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    AwaitCallback,
    Complete,
    Failed(String),
}

/// One pipeline step. Implementations hold no per-pipeline state.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called when the stage becomes current
    async fn prepare(&self, context: &mut PipelineContext) -> Result<StageResult>;

    /// Called for each terminal callback of a task this stage dispatched
    async fn on_callback(
        &self,
        context: &mut PipelineContext,
        callback: &TaskCallback,
    ) -> Result<StageResult>;
}

/// Stage implementations by name
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn PipelineStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.insert(stage.name().to_string(), stage);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PipelineStage>> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }
}

/// A pipeline to start
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub object_id: String,
    pub object: Option<Value>,
    pub stages: Vec<String>,
    pub callback_listener: Option<String>,
    pub failure_stage: Option<String>,
    pub data: Map<String, Value>,
}

impl Pipeline {
    pub fn new<S: Into<String>>(object_id: impl Into<String>, stages: impl IntoIterator<Item = S>) -> Self {
        Self {
            object_id: object_id.into(),
            object: None,
            stages: stages.into_iter().map(Into::into).collect(),
            callback_listener: None,
            failure_stage: None,
            data: Map::new(),
        }
    }

    pub fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }

    pub fn with_failure_stage(mut self, stage: impl Into<String>) -> Self {
        self.failure_stage = Some(stage.into());
        self
    }

    pub fn with_callback_listener(mut self, listener: impl Into<String>) -> Self {
        self.callback_listener = Some(listener.into());
        self
    }

    pub fn with_data<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(|source| PipelineError::Data {
            key: key.to_string(),
            source,
        })?;
        self.data.insert(key.to_string(), value);
        Ok(self)
    }
}

/// Mutable state of one pipeline, handed to its stages
pub struct PipelineContext {
    object_id: String,
    object: Option<Value>,
    stages: VecDeque<String>,
    data: Map<String, Value>,
    outstanding: BTreeSet<Uuid>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl PipelineContext {
    pub fn new(
        object_id: impl Into<String>,
        stages: impl IntoIterator<Item = String>,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            object: None,
            stages: stages.into_iter().collect(),
            data: Map::new(),
            outstanding: BTreeSet::new(),
            dispatcher,
        }
    }

    pub(crate) fn restore(
        mut self,
        object: Option<Value>,
        data: Map<String, Value>,
        outstanding: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        self.object = object;
        self.data = data;
        self.outstanding = outstanding.into_iter().collect();
        self
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Object description the pipeline was started with
    pub fn object(&self) -> Option<&Value> {
        self.object.as_ref()
    }

    pub fn current_stage(&self) -> Option<&str> {
        self.stages.front().map(String::as_str)
    }

    /// Remaining stages, current first
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(String::as_str)
    }

    /// Run `stage` right after the current one
    pub fn insert_stage_after_current(&mut self, stage: impl Into<String>) {
        let at = self.stages.len().min(1);
        self.stages.insert(at, stage.into());
    }

    pub(crate) fn advance(&mut self) -> Option<String> {
        self.stages.pop_front()
    }

    pub(crate) fn clear_stages(&mut self) {
        self.stages.clear();
    }

    pub(crate) fn replace_stages(&mut self, stage: String) {
        self.stages.clear();
        self.stages.push_back(stage);
    }

    /// Send `task` to the queue on behalf of the current stage. Its
    /// callbacks will be routed back to this pipeline.
    pub fn dispatch(&mut self, task: Task) -> Result<Uuid> {
        let task = task.for_object(self.object_id.clone());
        let id = task.id;
        self.dispatcher.dispatch(task)?;
        self.outstanding.insert(id);
        Ok(id)
    }

    /// Tasks dispatched by the current stage that have not reported
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub(crate) fn outstanding_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.outstanding.iter()
    }

    pub(crate) fn settle(&mut self, task_id: &Uuid) -> bool {
        self.outstanding.remove(task_id)
    }

    pub(crate) fn clear_outstanding(&mut self) {
        self.outstanding.clear();
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.data
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| PipelineError::Data {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| PipelineError::Data {
            key: key.to_string(),
            source,
        })?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    pub(crate) fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::queue::Result as QueueResult;
    use std::sync::Mutex;

    /// Dispatcher that records tasks instead of queueing them
    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub tasks: Mutex<Vec<Task>>,
    }

    impl RecordingDispatcher {
        pub fn take(&self) -> Vec<Task> {
            std::mem::take(&mut *self.tasks.lock().unwrap())
        }
    }

    impl TaskDispatcher for RecordingDispatcher {
        fn dispatch(&self, task: Task) -> QueueResult<u64> {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(task);
            Ok(tasks.len() as u64 - 1)
        }
    }
}
