//! Wiring: builds the queue, store, tools and pipeline engine from a
//! [`Config`] and runs the worker and callback delivery loops.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::ledger::{FjallStore, LedgerError};
use crate::messaging::{CallbackHandler, run_delivery, status_channel};
use crate::observability::Metrics;
use crate::pipeline::stages::standard_stages;
use crate::pipeline::{PipelineEngine, PipelineError};
use crate::protocol::{ProtocolError, ProtocolHandlerResolver};
use crate::queue::{FjallQueue, QueueError, Settling, TaskBroker};
use crate::tools::{ToolContext, WorkerToolRegistry, standard_tools};
use crate::worker::Worker;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("job store: {0}")]
    Store(#[from] LedgerError),

    #[error("protocols: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("pipelines: {0}")]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything a worker process shares between its loops and the status
/// endpoint
pub struct Runtime {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub queue: Arc<FjallQueue>,
    pub broker: Arc<TaskBroker>,
    pub store: Arc<FjallStore>,
    pub engine: Arc<PipelineEngine>,
    pub registry: Arc<WorkerToolRegistry>,
}

impl Runtime {
    /// Open with every built-in protocol handler
    pub async fn open(config: Config) -> Result<Self> {
        let resolver = ProtocolHandlerResolver::with_defaults(&config.protocols.settings())?;
        Self::with_resolver(config, Arc::new(resolver)).await
    }

    /// Open with a caller-supplied resolver
    pub async fn with_resolver(
        config: Config,
        resolver: Arc<ProtocolHandlerResolver>,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());

        let context =
            ToolContext::new(resolver).with_max_buffer_bytes(config.protocols.max_buffer_bytes);
        let tools = standard_tools(&context);
        let registry = Arc::new(WorkerToolRegistry::with_capacity_overrides(
            tools,
            &config.tools.capacity,
        ));

        let queue = Arc::new(FjallQueue::open(&config.queue.path)?);
        let broker = Arc::new(TaskBroker::new(
            queue.clone(),
            config.queue.max_retries,
            metrics.clone(),
        ));

        let store = Arc::new(FjallStore::open(&config.store.path)?);
        let engine = Arc::new(PipelineEngine::new(
            standard_stages(),
            broker.clone(),
            store.clone(),
            metrics.clone(),
        ));
        engine.recover().await?;

        info!(
            queue = %config.queue.path.display(),
            store = %config.store.path.display(),
            "Runtime ready"
        );
        Ok(Self {
            config,
            metrics,
            queue,
            broker,
            store,
            engine,
            registry,
        })
    }

    /// Start the worker and callback delivery. When `shutdown` fires the
    /// worker stops taking tasks, running tools finish, and delivery drains
    /// their callbacks before the returned handle completes.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let (sender, receiver) = status_channel(self.config.queue.status_capacity);
        let worker = Worker::new(
            self.broker.clone(),
            self.registry.clone(),
            sender,
            self.config.queue.worker_config(),
        );
        let downstream: Arc<dyn CallbackHandler> = self.engine.clone();
        let settling: Arc<dyn CallbackHandler> =
            Arc::new(Settling::new(self.broker.clone(), downstream));
        let delivery_config = self.config.queue.delivery_config();

        tokio::spawn(async move {
            // Delivery ends once every sender is gone, after the worker
            let delivery = tokio::spawn(run_delivery(
                receiver,
                settling,
                delivery_config,
                CancellationToken::new(),
            ));
            let dispatched = worker.run(shutdown).await;
            let delivered = delivery.await.unwrap_or_default();
            info!(dispatched, delivered, "Runtime stopped");
        })
    }
}
