//! Worker-side task executors
//!
//! One [`Tool`] per [`TaskType`]. A tool's `run` does the work and returns its
//! output or a [`ToolError`]; the provided `execute` turns either into exactly
//! one terminal [`TaskStatusUpdate`] delivered through the task's
//! [`ToolCallback`]. Panics inside `run` are caught there too, so nothing
//! escapes the tool boundary.

mod delete;
mod hash;
mod manifest;
pub mod registry;
mod restore;
mod transfer;
mod upload;

pub use delete::DeleteTool;
pub use hash::HashTool;
pub use manifest::{MANIFEST_LIMIT, ManifestParseTool};
pub use registry::{CapacityError, ToolInfo, WorkerToolRegistry};
pub use restore::RestoreTool;
pub use transfer::TransferTool;
pub use upload::AwsUploadTool;

use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::hash::HashEngine;
use crate::humanize::ByteSize;
use crate::messaging::{StatusSender, TaskCallback};
use crate::protocol::glacier::{ArchiveRetriever, GlacierMultipartTarget, GlacierRetriever};
use crate::protocol::s3::S3MultipartTarget;
use crate::protocol::{ProtocolHandlerResolver, ProtocolSettings};
use crate::task::{Task, TaskOutput, TaskStatusUpdate, TaskType};

/// Failure of a tool run, classified by whether durable state may remain
#[derive(Debug, Error)]
pub enum ToolError {
    /// Nothing durable was changed; safe to retry as is
    #[error("{0}")]
    Clean(String),

    /// Partial state may have been left behind
    #[error("{0}")]
    Dirty(String),
}

impl ToolError {
    pub fn clean(error: impl Display) -> Self {
        ToolError::Clean(error.to_string())
    }

    pub fn dirty(error: impl Display) -> Self {
        ToolError::Dirty(error.to_string())
    }

    /// The task carried a configuration for another task type
    pub fn mismatch(tool: TaskType, task: &Task) -> Self {
        ToolError::Clean(format!(
            "{} tool cannot run a {} task",
            tool,
            task.task_type()
        ))
    }

    pub fn into_update(self) -> TaskStatusUpdate {
        match self {
            ToolError::Clean(message) => TaskStatusUpdate::failed_clean(message),
            ToolError::Dirty(message) => TaskStatusUpdate::failed_dirty(message),
        }
    }
}

/// Reporting channel for one delivery of one task.
///
/// `complete` consumes the callback, so at most one terminal update can be
/// sent per delivery.
pub struct ToolCallback {
    delivery: u64,
    task: Task,
    sender: StatusSender,
}

impl ToolCallback {
    pub fn new(delivery: u64, task: Task, sender: StatusSender) -> Self {
        Self {
            delivery,
            task,
            sender,
        }
    }

    pub fn delivery(&self) -> u64 {
        self.delivery
    }

    /// Best effort; dropped when the channel is full
    pub fn progress(&self, percent: u8) {
        let callback = TaskCallback::new(self.delivery, &self.task, TaskStatusUpdate::progress(percent));
        if self.sender.try_send(callback).is_err() {
            debug!(task_id = %self.task.id, percent, "Progress update dropped");
        }
    }

    pub async fn complete(self, update: TaskStatusUpdate) {
        let callback = TaskCallback::new(self.delivery, &self.task, update);
        if self.sender.send(callback).await.is_err() {
            error!(
                task_id = %self.task.id,
                delivery = self.delivery,
                "Status channel closed; terminal update lost"
            );
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Registry name; the task type tag
    fn name(&self) -> &'static str {
        self.task_type().as_str()
    }

    /// Concurrent executions allowed on one worker
    fn max_concurrency(&self) -> usize;

    async fn run(&self, task: &Task, callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError>;

    /// Run `task` and report exactly one terminal update
    async fn execute(&self, task: Task, callback: ToolCallback) {
        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(self.run(&task, &callback))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ToolError::Dirty(format!("{} tool panicked", self.name()))));

        let update = match outcome {
            Ok(output) => {
                info!(
                    task_id = %task.id,
                    tool = self.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                TaskStatusUpdate::completed(output)
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    tool = self.name(),
                    attempt = task.retry_count,
                    error = %e,
                    dirty = matches!(e, ToolError::Dirty(_)),
                    "Task failed"
                );
                e.into_update()
            }
        };

        callback.complete(update).await;
    }
}

/// Shared dependencies of the built-in tools
#[derive(Clone)]
pub struct ToolContext {
    pub resolver: Arc<ProtocolHandlerResolver>,
    pub hash_engine: HashEngine,
    pub retriever: Arc<dyn ArchiveRetriever>,
    /// Largest upload part, or length-less transfer source, held in memory
    pub max_buffer_bytes: ByteSize,
}

impl ToolContext {
    pub fn new(resolver: Arc<ProtocolHandlerResolver>) -> Self {
        Self {
            resolver,
            hash_engine: HashEngine::default(),
            retriever: Arc::new(GlacierRetriever),
            max_buffer_bytes: ProtocolSettings::default().max_buffer_bytes,
        }
    }

    pub fn with_max_buffer_bytes(mut self, max_buffer_bytes: ByteSize) -> Self {
        self.max_buffer_bytes = max_buffer_bytes;
        self
    }
}

/// Every built-in tool, one per task type
pub fn standard_tools(context: &ToolContext) -> Vec<Arc<dyn Tool>> {
    let resolver = &context.resolver;
    vec![
        Arc::new(DeleteTool::new(Arc::clone(resolver))),
        Arc::new(HashTool::new(Arc::clone(resolver), context.hash_engine.clone())),
        Arc::new(
            TransferTool::new(Arc::clone(resolver)).with_buffer_limit(context.max_buffer_bytes),
        ),
        Arc::new(AwsUploadTool::new(
            TaskType::S3Upload,
            Arc::clone(resolver),
            Arc::new(S3MultipartTarget),
        )
        .with_part_limit(context.max_buffer_bytes)),
        Arc::new(AwsUploadTool::new(
            TaskType::GlacierUpload,
            Arc::clone(resolver),
            Arc::new(GlacierMultipartTarget),
        )
        .with_part_limit(context.max_buffer_bytes)),
        Arc::new(RestoreTool::new(Arc::clone(&context.retriever))),
        Arc::new(ManifestParseTool::new(Arc::clone(resolver))),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the tool tests

    use super::*;
    use crate::messaging::{StatusReceiver, status_channel};
    use crate::protocol::object::ObjectStoreHandler;
    use crate::protocol::{ProtocolError, ProtocolHandler, Result as ProtocolResult, factory};
    use object_store::memory::InMemory;
    use url::Url;

    /// Handler whose every operation fails after a successful `init`
    pub struct BrokenHandler;

    #[async_trait]
    impl ProtocolHandler for BrokenHandler {
        fn scheme(&self) -> &'static str {
            "broken"
        }

        async fn init(&mut self, _uri: &Url) -> ProtocolResult<()> {
            Ok(())
        }

        async fn delete(&mut self) -> ProtocolResult<()> {
            Err(ProtocolError::transport("broken://", "permission denied"))
        }

        async fn open_stream(&mut self) -> ProtocolResult<crate::protocol::ByteReader> {
            Err(ProtocolError::transport("broken://", "connection refused"))
        }
    }

    pub const STREAM_PAYLOAD: &[u8] = b"restored archive bytes";

    /// Readable source that cannot report its length, like a retrieval job
    pub struct StreamOnlyHandler;

    #[async_trait]
    impl ProtocolHandler for StreamOnlyHandler {
        fn scheme(&self) -> &'static str {
            "stream"
        }

        async fn init(&mut self, _uri: &Url) -> ProtocolResult<()> {
            Ok(())
        }

        async fn open_stream(&mut self) -> ProtocolResult<crate::protocol::ByteReader> {
            Ok(Box::new(STREAM_PAYLOAD))
        }
    }

    /// Destination that stores each upload under a new archive id, like a
    /// vault
    #[derive(Default)]
    pub struct VaultHandler {
        vault: Option<String>,
        archive: Option<String>,
    }

    #[async_trait]
    impl ProtocolHandler for VaultHandler {
        fn scheme(&self) -> &'static str {
            "vault"
        }

        async fn init(&mut self, uri: &Url) -> ProtocolResult<()> {
            self.vault = Some(uri.to_string());
            Ok(())
        }

        async fn copy_to(
            &mut self,
            mut source: crate::protocol::ByteReader,
            length: u64,
        ) -> ProtocolResult<()> {
            let mut sink = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut source, &mut sink)
                .await
                .map_err(|e| ProtocolError::io("vault://", e))?;
            assert_eq!(sink.len() as u64, length);
            let vault = self.vault.as_deref().ok_or(ProtocolError::NotInitialized)?;
            self.archive = Some(format!("{vault}/archives/A1"));
            Ok(())
        }

        fn location(&self) -> Option<String> {
            self.archive.clone()
        }
    }

    /// `file`, an in-memory `mem` scheme, a failing `broken` scheme and the
    /// `stream` and `vault` doubles above
    pub fn resolver(memory: Arc<InMemory>) -> Arc<ProtocolHandlerResolver> {
        let mut resolver = ProtocolHandlerResolver::new();
        resolver.register("file", factory(ObjectStoreHandler::local));
        resolver.register(
            "mem",
            factory(move || ObjectStoreHandler::keyed("mem", memory.clone())),
        );
        resolver.register("broken", factory(|| BrokenHandler));
        resolver.register("stream", factory(|| StreamOnlyHandler));
        resolver.register("vault", factory(VaultHandler::default));
        Arc::new(resolver)
    }

    pub fn callback(task: &Task) -> (ToolCallback, StatusReceiver) {
        let (tx, rx) = status_channel(64);
        (ToolCallback::new(1, task.clone(), tx), rx)
    }

    /// Execute `task` and return its terminal update
    pub async fn execute(tool: &dyn Tool, task: Task) -> TaskStatusUpdate {
        let (callback, mut rx) = self::callback(&task);
        tool.execute(task, callback).await;
        loop {
            let received = rx.recv().await.expect("terminal update");
            if received.is_terminal() {
                assert!(rx.try_recv().is_err(), "more than one terminal update");
                return received.update;
            }
        }
    }
}
