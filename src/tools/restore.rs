use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use url::Url;

use super::{Tool, ToolCallback, ToolError};
use crate::protocol::aws::redact;
use crate::protocol::glacier::ArchiveRetriever;
use crate::task::{RestoreTaskOutput, Task, TaskConfiguration, TaskOutput, TaskType};

const DEFAULT_CONCURRENCY: usize = 4;

/// Starts retrieval of an archived object and reports where its bytes will
/// be readable once the retrieval completes.
pub struct RestoreTool {
    retriever: Arc<dyn ArchiveRetriever>,
}

impl RestoreTool {
    pub fn new(retriever: Arc<dyn ArchiveRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for RestoreTool {
    fn task_type(&self) -> TaskType {
        TaskType::Restore
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, _callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let TaskConfiguration::Restore(config) = &task.configuration else {
            return Err(ToolError::mismatch(self.task_type(), task));
        };
        let source = Url::parse(&config.source)
            .map_err(|e| ToolError::Clean(format!("source: {}", e)))?;

        let job = self
            .retriever
            .request_retrieval(&source)
            .await
            .map_err(ToolError::clean)?;

        info!(task_id = %task.id, job = %redact(&job), "Restore requested");
        // The job URI keeps the source's credentials so it can be read later
        Ok(Some(TaskOutput::Restore(RestoreTaskOutput {
            destination: job.to_string(),
        })))
    }
}
