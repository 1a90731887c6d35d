use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Tool, ToolCallback};
use crate::messaging::StatusSender;
use crate::task::{Task, TaskType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("no tool registered as `{0}`")]
    UnknownTool(String),

    #[error("tool `{0}` has no available capacity")]
    Exhausted(String),

    #[error("tool `{name}` is already at its maximum capacity of {max}")]
    Overflow { name: String, max: usize },
}

/// Capacity of one tool on this worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub max: usize,
    pub available: usize,
}

/// Tools by name plus a counting semaphore per tool.
///
/// `decrease_available_capacity` admits one execution and fails at zero;
/// `increase_available_capacity` releases one and fails above `max`. Both
/// failures mean admission bookkeeping is wrong, they are not back-pressure.
pub struct WorkerToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    capacity: Mutex<BTreeMap<String, ToolInfo>>,
}

impl WorkerToolRegistry {
    /// One [`ToolInfo`] per distinct tool name, at the tool's declared
    /// concurrency. A later tool with the same name replaces an earlier one.
    pub fn new(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        Self::with_capacity_overrides(tools, &BTreeMap::new())
    }

    /// Like [`WorkerToolRegistry::new`], with configured capacities taking
    /// precedence over the tools' own.
    pub fn with_capacity_overrides(
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
        overrides: &BTreeMap<String, usize>,
    ) -> Self {
        let mut by_name = BTreeMap::new();
        let mut capacity = BTreeMap::new();

        for tool in tools {
            let name = tool.name().to_string();
            let max = overrides
                .get(&name)
                .copied()
                .unwrap_or_else(|| tool.max_concurrency());
            capacity.insert(
                name.clone(),
                ToolInfo {
                    name: name.clone(),
                    max,
                    available: max,
                },
            );
            by_name.insert(name, tool);
        }

        info!(tools = by_name.len(), "Tool registry ready");
        Self {
            tools: by_name,
            capacity: Mutex::new(capacity),
        }
    }

    fn capacity(&self) -> MutexGuard<'_, BTreeMap<String, ToolInfo>> {
        // Counters are plain integers; a poisoned guard still holds valid state
        self.capacity.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, CapacityError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| CapacityError::UnknownTool(name.to_string()))
    }

    pub fn decrease_available_capacity(&self, name: &str) -> Result<(), CapacityError> {
        let mut capacity = self.capacity();
        let info = capacity
            .get_mut(name)
            .ok_or_else(|| CapacityError::UnknownTool(name.to_string()))?;
        if info.available == 0 {
            return Err(CapacityError::Exhausted(name.to_string()));
        }
        info.available -= 1;
        debug!(tool = name, available = info.available, "Capacity taken");
        Ok(())
    }

    pub fn increase_available_capacity(&self, name: &str) -> Result<(), CapacityError> {
        let mut capacity = self.capacity();
        let info = capacity
            .get_mut(name)
            .ok_or_else(|| CapacityError::UnknownTool(name.to_string()))?;
        if info.available >= info.max {
            return Err(CapacityError::Overflow {
                name: name.to_string(),
                max: info.max,
            });
        }
        info.available += 1;
        debug!(tool = name, available = info.available, "Capacity released");
        Ok(())
    }

    pub fn tool_info(&self) -> Vec<ToolInfo> {
        self.capacity().values().cloned().collect()
    }

    /// Task types with at least one free slot
    pub fn admissible(&self) -> Vec<TaskType> {
        let capacity = self.capacity();
        TaskType::ALL
            .into_iter()
            .filter(|t| capacity.get(t.as_str()).is_some_and(|info| info.available > 0))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.capacity().values().all(|info| info.available == info.max)
    }

    /// Admit `task` and run its tool in the background; capacity is
    /// released when the tool has reported.
    pub fn dispatch(
        self: &Arc<Self>,
        delivery: u64,
        task: Task,
        status: StatusSender,
    ) -> Result<JoinHandle<()>, CapacityError> {
        let name = task.task_type().as_str();
        let tool = self.get(name)?;
        self.decrease_available_capacity(name)?;

        debug!(task_id = %task.id, tool = name, delivery, "Dispatching task");
        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let callback = ToolCallback::new(delivery, task.clone(), status);
            tool.execute(task, callback).await;
            if let Err(e) = registry.increase_available_capacity(name) {
                error!(tool = name, error = %e, "Capacity accounting is inconsistent");
            }
        }))
    }
}
