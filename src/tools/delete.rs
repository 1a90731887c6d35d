use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Tool, ToolCallback, ToolError};
use crate::protocol::{self, ProtocolHandlerResolver};
use crate::task::{Task, TaskConfiguration, TaskOutput, TaskType};

const DEFAULT_CONCURRENCY: usize = 4;

/// Deletes every location of the task concurrently. One failed location does
/// not stop the others; any failure makes the task dirty.
pub struct DeleteTool {
    resolver: Arc<ProtocolHandlerResolver>,
}

impl DeleteTool {
    pub fn new(resolver: Arc<ProtocolHandlerResolver>) -> Self {
        Self { resolver }
    }

    async fn delete_one(&self, location: &str) -> protocol::Result<()> {
        let mut handler = self.resolver.resolve_str(location).await?;
        handler.delete().await?;
        handler.close().await
    }
}

#[async_trait]
impl Tool for DeleteTool {
    fn task_type(&self) -> TaskType {
        TaskType::Delete
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, _callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let TaskConfiguration::Delete(config) = &task.configuration else {
            return Err(ToolError::mismatch(self.task_type(), task));
        };

        let results = join_all(config.locations.iter().map(|l| self.delete_one(l))).await;

        let failures: Vec<String> = config
            .locations
            .iter()
            .zip(results)
            .filter_map(|(location, result)| {
                let location = protocol::display_uri(location);
                match result {
                    Ok(()) => {
                        debug!(task_id = %task.id, %location, "Location deleted");
                        None
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, %location, error = %e, "Delete failed");
                        Some(format!("{} ({})", location, e))
                    }
                }
            })
            .collect();

        if failures.is_empty() {
            return Ok(None);
        }
        Err(ToolError::Dirty(format!(
            "failed to delete {} of {} locations: {}",
            failures.len(),
            config.locations.len(),
            failures.join("; ")
        )))
    }
}
