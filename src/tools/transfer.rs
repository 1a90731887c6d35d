use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Tool, ToolCallback, ToolError};
use crate::hash::{HashAlgorithm, HashStrategy, HashingReader};
use crate::humanize::ByteSize;
use crate::protocol::{
    ByteReader, ProtocolError, ProtocolHandler, ProtocolHandlerResolver, ProtocolSettings,
    buffer_to_end, display_uri,
};
use crate::task::{
    ContentInfo, Task, TaskConfiguration, TaskOutput, TaskType, TransferInstruction,
    TransferTaskOutput,
};

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_FAN_OUT: usize = 4;

/// Streams each source to its destination, counting and MD5-hashing the
/// bytes on the way through. A source that cannot report its length is
/// read into memory first, up to `buffer_limit`.
pub struct TransferTool {
    resolver: Arc<ProtocolHandlerResolver>,
    fan_out: usize,
    buffer_limit: ByteSize,
}

impl TransferTool {
    pub fn new(resolver: Arc<ProtocolHandlerResolver>) -> Self {
        Self {
            resolver,
            fan_out: DEFAULT_FAN_OUT,
            buffer_limit: ProtocolSettings::default().max_buffer_bytes,
        }
    }

    pub fn with_buffer_limit(mut self, buffer_limit: ByteSize) -> Self {
        self.buffer_limit = buffer_limit;
        self
    }

    /// Instructions of one task that may run at once
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    async fn transfer(&self, instruction: &TransferInstruction) -> Result<ContentInfo, ToolError> {
        let mut source = self
            .resolver
            .resolve_str(&instruction.source)
            .await
            .map_err(ToolError::clean)?;
        let mut destination = self
            .resolver
            .resolve_str(&instruction.destination)
            .await
            .map_err(ToolError::clean)?;

        let (reader, length) = self.open_source(source.as_mut(), &instruction.source).await?;
        let (reader, tally) = HashingReader::new(reader, &[HashStrategy::whole(HashAlgorithm::Md5)]);

        // From here on the destination may hold a partial object
        destination
            .copy_to(Box::new(reader), length)
            .await
            .map_err(ToolError::dirty)?;
        let tally = tally.finish();

        source.close().await.map_err(ToolError::dirty)?;

        let written = destination.location();
        destination.close().await.map_err(ToolError::dirty)?;

        Ok(ContentInfo {
            source: instruction.source.clone(),
            destination: written.unwrap_or_else(|| instruction.destination.clone()),
            length: tally.bytes,
            hashes: tally.hashes,
        })
    }

    /// The source stream and its length
    async fn open_source(
        &self,
        source: &mut dyn ProtocolHandler,
        uri: &str,
    ) -> Result<(ByteReader, u64), ToolError> {
        match source.content_length().await {
            Ok(length) => {
                let reader = source.open_stream().await.map_err(ToolError::clean)?;
                Ok((reader, length))
            }
            Err(ProtocolError::Unsupported { .. }) => {
                debug!(source = %display_uri(uri), "Source has no length query, buffering");
                let reader = source.open_stream().await.map_err(ToolError::clean)?;
                let body = buffer_to_end(&display_uri(uri), reader, self.buffer_limit)
                    .await
                    .map_err(ToolError::clean)?;
                let length = body.len() as u64;
                let reader: ByteReader = Box::new(std::io::Cursor::new(body));
                Ok((reader, length))
            }
            Err(e) => Err(ToolError::clean(e)),
        }
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn task_type(&self) -> TaskType {
        TaskType::Transfer
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let TaskConfiguration::Transfer(config) = &task.configuration else {
            return Err(ToolError::mismatch(self.task_type(), task));
        };

        let total = config.transfers.len();
        let mut results: Vec<(usize, Result<ContentInfo, ToolError>)> = Vec::with_capacity(total);
        let transfers: Vec<_> = config
            .transfers
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, instruction)| async move { (index, self.transfer(&instruction).await) })
            .collect();
        let mut pending = stream::iter(transfers).buffer_unordered(self.fan_out);

        while let Some((index, result)) = pending.next().await {
            let instruction = &config.transfers[index];
            match &result {
                Ok(info) => debug!(
                    task_id = %task.id,
                    source = %display_uri(&instruction.source),
                    destination = %display_uri(&instruction.destination),
                    length = info.length,
                    "Transfer finished"
                ),
                Err(e) => warn!(
                    task_id = %task.id,
                    source = %display_uri(&instruction.source),
                    destination = %display_uri(&instruction.destination),
                    error = %e,
                    "Transfer failed"
                ),
            }
            results.push((index, result));
            callback.progress((results.len() * 100 / total.max(1)) as u8);
        }
        drop(pending);
        results.sort_by_key(|(index, _)| *index);

        let mut contents = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut dirty = false;
        for (index, result) in results {
            match result {
                Ok(info) => contents.push(info),
                Err(e) => {
                    dirty |= matches!(e, ToolError::Dirty(_));
                    failures.push(format!(
                        "{} -> {}: {}",
                        display_uri(&config.transfers[index].source),
                        display_uri(&config.transfers[index].destination),
                        e
                    ));
                }
            }
        }

        if !failures.is_empty() {
            let message = format!(
                "{} of {} transfers failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            );
            // Completed siblings have written their destinations
            return Err(if dirty || !contents.is_empty() {
                ToolError::Dirty(message)
            } else {
                ToolError::Clean(message)
            });
        }

        info!(task_id = %task.id, transfers = total, "Transfers completed");
        Ok(Some(TaskOutput::Transfer(TransferTaskOutput { contents })))
    }
}
