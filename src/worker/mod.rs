//! Worker process
//!
//! Pulls tasks the local tools have room for from the [`TaskBroker`], runs
//! them through the [`WorkerToolRegistry`] and lets their callbacks flow into
//! the status channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messaging::{StatusSender, TaskCallback};
use crate::queue::{Delivery, TaskBroker};
use crate::task::TaskStatusUpdate;
use crate::tools::WorkerToolRegistry;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to look for work when nothing wakes the worker
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct Worker {
    broker: Arc<TaskBroker>,
    registry: Arc<WorkerToolRegistry>,
    status: StatusSender,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        broker: Arc<TaskBroker>,
        registry: Arc<WorkerToolRegistry>,
        status: StatusSender,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            status,
            config,
        }
    }

    /// Run until `shutdown` fires, then wait for running tools to report.
    /// Returns the number of tasks dispatched.
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        info!(poll_interval = ?self.config.poll_interval, "Worker started");
        let mut running: Vec<JoinHandle<()>> = Vec::new();
        let mut dispatched = 0u64;

        loop {
            running.retain(|handle| !handle.is_finished());

            if let Some(delivery) = self.next_delivery() {
                self.dispatch(delivery, &mut running).await;
                dispatched += 1;
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.broker.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(running = running.len(), "Worker stopping, waiting for running tasks");
        for handle in running {
            if let Err(e) = handle.await {
                error!(error = %e, "Tool task did not finish cleanly");
            }
        }
        info!(dispatched, "Worker stopped");
        dispatched
    }

    fn next_delivery(&self) -> Option<Delivery> {
        let admissible = self.registry.admissible();
        if admissible.is_empty() {
            return None;
        }
        match self.broker.dequeue(&|task_type| admissible.contains(&task_type)) {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Failed to dequeue task");
                None
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery, running: &mut Vec<JoinHandle<()>>) {
        let Delivery { seq, task } = delivery;
        let task_id = task.id;

        match self.registry.dispatch(seq, task.clone(), self.status.clone()) {
            Ok(handle) => {
                self.broker.metrics().task_dispatched();
                debug!(%task_id, seq, "Task admitted");
                running.push(handle);
            }
            Err(e) => {
                // The queue handed over a task no tool can take; report it
                // so the broker can retry or dead-letter it
                warn!(%task_id, seq, error = %e, "Task not admitted");
                let update = TaskStatusUpdate::failed_clean(e.to_string());
                if self.status.send(TaskCallback::new(seq, &task, update)).await.is_err() {
                    error!(%task_id, "Status channel closed");
                }
            }
        }
    }
}
