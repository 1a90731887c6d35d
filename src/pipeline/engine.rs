use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, error, info, warn};

use super::{
    Pipeline, PipelineContext, PipelineError, PipelineState, Result, StageRegistry, StageResult,
};
use crate::ledger::{JobRecord, JobStore};
use crate::messaging::{CallbackHandler, TaskCallback};
use crate::observability::Metrics;
use crate::queue::TaskDispatcher;

const EVENT_CAPACITY: usize = 256;

/// Published when a pipeline reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_listener: Option<String>,
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

struct ActivePipeline {
    context: PipelineContext,
    state: PipelineState,
    failing: bool,
    failure_stage: Option<String>,
    callback_listener: Option<String>,
    message: Option<String>,
}

impl ActivePipeline {
    fn record(&self) -> JobRecord {
        JobRecord {
            object_id: self.context.object_id().to_string(),
            state: self.state,
            stages: self.context.stages().map(String::from).collect(),
            failure_stage: self.failure_stage.clone(),
            callback_listener: self.callback_listener.clone(),
            object: self.context.object().cloned(),
            data: self.context.data().clone(),
            outstanding: self.context.outstanding_ids().copied().collect(),
            failing: self.failing,
            message: self.message.clone(),
            status_timestamp: Utc::now(),
        }
    }

    fn event(&self) -> PipelineEvent {
        PipelineEvent {
            object_id: self.context.object_id().to_string(),
            callback_listener: self.callback_listener.clone(),
            state: self.state,
            message: self.message.clone(),
        }
    }
}

/// Drives pipelines from their first `prepare` to Completed or Failed.
///
/// Callbacks for one object are handled one at a time under that pipeline's
/// lock; different objects proceed independently. Every transition is
/// written to the [`JobStore`] before the engine moves on.
pub struct PipelineEngine {
    stages: StageRegistry,
    dispatcher: Arc<dyn TaskDispatcher>,
    store: Arc<dyn JobStore>,
    active: Mutex<HashMap<String, Arc<AsyncMutex<ActivePipeline>>>>,
    events: broadcast::Sender<PipelineEvent>,
    metrics: Arc<Metrics>,
}

impl PipelineEngine {
    pub fn new(
        stages: StageRegistry,
        dispatcher: Arc<dyn TaskDispatcher>,
        store: Arc<dyn JobStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            stages,
            dispatcher,
            store,
            active: Mutex::new(HashMap::new()),
            events,
            metrics,
        }
    }

    /// Terminal pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Latest stored record for `object_id`
    pub fn record(&self, object_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.store.get(object_id)?)
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<ActivePipeline>>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find(&self, object_id: &str) -> Option<Arc<AsyncMutex<ActivePipeline>>> {
        self.lock_active().get(object_id).cloned()
    }

    fn check_stage(&self, name: &str) -> Result<()> {
        if self.stages.contains(name) {
            Ok(())
        } else {
            Err(PipelineError::UnknownStage(name.to_string()))
        }
    }

    /// Start `pipeline` and run it until it waits for a callback or ends
    pub async fn start(&self, pipeline: Pipeline) -> Result<PipelineState> {
        if pipeline.stages.is_empty() {
            return Err(PipelineError::EmptyPipeline(pipeline.object_id));
        }
        for stage in pipeline.stages.iter().chain(pipeline.failure_stage.iter()) {
            self.check_stage(stage)?;
        }

        let context = PipelineContext::new(
            pipeline.object_id.clone(),
            pipeline.stages,
            self.dispatcher.clone(),
        )
        .restore(pipeline.object, pipeline.data, []);
        let entry = Arc::new(AsyncMutex::new(ActivePipeline {
            context,
            state: PipelineState::Preparing,
            failing: false,
            failure_stage: pipeline.failure_stage,
            callback_listener: pipeline.callback_listener,
            message: None,
        }));

        // Held before the pipeline becomes visible to callbacks
        let mut guard = entry.lock().await;
        {
            let mut active = self.lock_active();
            if active.contains_key(&pipeline.object_id) {
                return Err(PipelineError::DuplicatePipeline(pipeline.object_id));
            }
            active.insert(pipeline.object_id.clone(), entry.clone());
        }

        info!(object_id = %pipeline.object_id, "Pipeline started");
        let result = self.prepare_current(&mut guard).await;
        self.drive(&mut guard, result).await
    }

    /// Re-activate pipelines left unfinished in the store. Their outstanding
    /// tasks are still in the queue and will call back as usual; a pipeline
    /// stored with nothing outstanding prepares its current stage again.
    pub async fn recover(&self) -> Result<usize> {
        let mut stalled = Vec::new();
        let mut recovered = 0;
        {
            let mut active = self.lock_active();
            for record in self.store.list()? {
                if record.state.is_terminal() || active.contains_key(&record.object_id) {
                    continue;
                }
                let idle = record.outstanding.is_empty();
                let context = PipelineContext::new(
                    record.object_id.clone(),
                    record.stages,
                    self.dispatcher.clone(),
                )
                .restore(record.object, record.data, record.outstanding);
                let entry = Arc::new(AsyncMutex::new(ActivePipeline {
                    context,
                    state: record.state,
                    failing: record.failing,
                    failure_stage: record.failure_stage,
                    callback_listener: record.callback_listener,
                    message: record.message,
                }));
                if idle {
                    stalled.push(entry.clone());
                }
                active.insert(record.object_id, entry);
                recovered += 1;
            }
        }

        for entry in stalled {
            let mut guard = entry.lock().await;
            debug!(
                object_id = %guard.context.object_id(),
                state = %guard.state,
                "Nothing outstanding, preparing current stage again"
            );
            let result = self.prepare_current(&mut guard).await;
            self.drive(&mut guard, result).await?;
        }

        if recovered > 0 {
            info!(recovered, "Recovered active pipelines");
        }
        Ok(recovered)
    }

    /// Route a task callback to its pipeline.
    ///
    /// Progress updates, callbacks without an active pipeline and callbacks
    /// for tasks the current stage is not waiting on are ignored and return
    /// `None`.
    pub async fn on_callback(&self, callback: &TaskCallback) -> Result<Option<PipelineState>> {
        if !callback.is_terminal() {
            return Ok(None);
        }
        let Some(object_id) = callback.object_id.as_deref() else {
            debug!(task_id = %callback.task_id, "Callback has no object id, ignoring");
            return Ok(None);
        };
        let Some(entry) = self.find(object_id) else {
            debug!(object_id, task_id = %callback.task_id, "No active pipeline for callback");
            return Ok(None);
        };

        let mut guard = entry.lock().await;
        if guard.state.is_terminal() || !guard.context.settle(&callback.task_id) {
            debug!(object_id, task_id = %callback.task_id, "Callback not awaited, ignoring");
            return Ok(None);
        }

        let result = match guard.context.current_stage().map(str::to_string) {
            Some(name) => match self.stages.get(&name) {
                Ok(stage) => stage.on_callback(&mut guard.context, callback).await,
                Err(e) => Err(e),
            },
            None => Ok(StageResult::Complete),
        };
        self.drive(&mut guard, result).await.map(Some)
    }

    async fn prepare_current(&self, pipeline: &mut ActivePipeline) -> Result<StageResult> {
        let Some(name) = pipeline.context.current_stage().map(str::to_string) else {
            return Ok(StageResult::Complete);
        };
        pipeline.state = if pipeline.failing {
            PipelineState::Failing
        } else {
            PipelineState::Preparing
        };
        self.persist(pipeline)?;

        debug!(object_id = %pipeline.context.object_id(), stage = %name, "Preparing stage");
        let stage = self.stages.get(&name)?;
        stage.prepare(&mut pipeline.context).await
    }

    /// [`apply`](Self::apply), abandoning the pipeline when it fails
    async fn drive(
        &self,
        pipeline: &mut ActivePipeline,
        result: Result<StageResult>,
    ) -> Result<PipelineState> {
        let outcome = self.apply(pipeline, result).await;
        if let Err(e) = &outcome {
            self.abandon(pipeline, e);
        }
        outcome
    }

    /// Follow stage results until the pipeline waits or ends
    async fn apply(
        &self,
        pipeline: &mut ActivePipeline,
        mut result: Result<StageResult>,
    ) -> Result<PipelineState> {
        loop {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(PipelineError::Store(e)) => return Err(PipelineError::Store(e)),
                Err(e) => {
                    error!(object_id = %pipeline.context.object_id(), error = %e, "Stage error");
                    StageResult::Failed(e.to_string())
                }
            };

            match outcome {
                StageResult::AwaitCallback => {
                    if pipeline.context.outstanding() == 0 {
                        warn!(
                            object_id = %pipeline.context.object_id(),
                            "Stage awaits a callback without outstanding tasks"
                        );
                        result = Ok(StageResult::Failed(
                            "stage is waiting without outstanding tasks".to_string(),
                        ));
                        continue;
                    }
                    if !pipeline.failing {
                        pipeline.state = PipelineState::AwaitingCallback;
                    }
                    self.persist(pipeline)?;
                    return Ok(pipeline.state);
                }
                StageResult::Complete => {
                    if !pipeline.failing {
                        pipeline.state = PipelineState::Advancing;
                    }
                    pipeline.context.clear_outstanding();
                    if let Some(done) = pipeline.context.advance() {
                        debug!(object_id = %pipeline.context.object_id(), stage = %done, "Stage complete");
                    }
                    if pipeline.context.current_stage().is_none() {
                        let state = if pipeline.failing {
                            PipelineState::Failed
                        } else {
                            PipelineState::Completed
                        };
                        return self.finish(pipeline, state);
                    }
                    self.persist(pipeline)?;
                    result = self.prepare_current(pipeline).await;
                }
                StageResult::Failed(message) => {
                    warn!(
                        object_id = %pipeline.context.object_id(),
                        stage = pipeline.context.current_stage().unwrap_or("-"),
                        %message,
                        "Stage failed"
                    );
                    pipeline.context.clear_outstanding();
                    if pipeline.failing {
                        // The failure stage itself failed; no further compensation
                        let original = pipeline.message.take().unwrap_or_default();
                        pipeline.message = Some(format!("{}; failure stage: {}", original, message));
                        return self.finish(pipeline, PipelineState::Failed);
                    }

                    pipeline.failing = true;
                    pipeline.message = Some(message);
                    match pipeline.failure_stage.clone() {
                        Some(stage) => {
                            pipeline.context.replace_stages(stage);
                            result = self.prepare_current(pipeline).await;
                        }
                        None => {
                            pipeline.context.clear_stages();
                            return self.finish(pipeline, PipelineState::Failed);
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, pipeline: &mut ActivePipeline, state: PipelineState) -> Result<PipelineState> {
        pipeline.state = state;
        self.persist(pipeline)?;
        self.lock_active().remove(pipeline.context.object_id());

        match state {
            PipelineState::Completed => {
                self.metrics.pipeline_completed();
                info!(object_id = %pipeline.context.object_id(), "Pipeline completed");
            }
            _ => {
                self.metrics.pipeline_failed();
                warn!(
                    object_id = %pipeline.context.object_id(),
                    message = pipeline.message.as_deref().unwrap_or(""),
                    "Pipeline failed"
                );
            }
        }
        // No subscribers is fine
        let _ = self.events.send(pipeline.event());
        Ok(state)
    }

    /// Drop a pipeline whose state could not be stored. Its object may be
    /// started again; the last stored record is left for `recover`.
    fn abandon(&self, pipeline: &mut ActivePipeline, error: &PipelineError) {
        pipeline.state = PipelineState::Failed;
        pipeline.message = Some(error.to_string());
        self.lock_active().remove(pipeline.context.object_id());
        self.metrics.pipeline_failed();
        error!(object_id = %pipeline.context.object_id(), error = %error, "Pipeline abandoned");
        let _ = self.events.send(pipeline.event());
    }

    fn persist(&self, pipeline: &ActivePipeline) -> Result<()> {
        self.store.put(&pipeline.record())?;
        Ok(())
    }
}

#[async_trait]
impl CallbackHandler for PipelineEngine {
    async fn handle(&self, callback: TaskCallback) {
        if let Err(e) = self.on_callback(&callback).await {
            error!(task_id = %callback.task_id, error = %e, "Pipeline failed to handle callback");
        }
    }
}
