use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Tool, ToolCallback, ToolError};
use crate::hash::{HashEngine, HashStrategy};
use crate::protocol::{ProtocolHandlerResolver, display_uri};
use crate::task::{HashInput, HashTaskOutput, Task, TaskConfiguration, TaskOutput, TaskType};

const DEFAULT_CONCURRENCY: usize = 2;

/// Computes every requested digest of one source in a single read
pub struct HashTool {
    resolver: Arc<ProtocolHandlerResolver>,
    engine: HashEngine,
}

impl HashTool {
    pub fn new(resolver: Arc<ProtocolHandlerResolver>, engine: HashEngine) -> Self {
        Self { resolver, engine }
    }
}

#[async_trait]
impl Tool for HashTool {
    fn task_type(&self) -> TaskType {
        TaskType::Hash
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, _callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let TaskConfiguration::Hash(config) = &task.configuration else {
            return Err(ToolError::mismatch(self.task_type(), task));
        };

        let strategies: Vec<HashStrategy> = config.hashes.iter().map(HashInput::strategy).collect();

        let mut handler = self
            .resolver
            .resolve_str(&config.source)
            .await
            .map_err(ToolError::clean)?;
        let mut reader = handler.open_stream().await.map_err(ToolError::clean)?;
        let hashes = self
            .engine
            .digest(&mut reader, &strategies)
            .await
            .map_err(|e| ToolError::Clean(format!("{}: {}", display_uri(&config.source), e)))?;
        drop(reader);
        handler.close().await.map_err(ToolError::clean)?;

        debug!(task_id = %task.id, count = hashes.len(), "Hashes computed");
        Ok(Some(TaskOutput::Hash(HashTaskOutput { hashes })))
    }
}
