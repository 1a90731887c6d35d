use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use url::Url;

use super::{Tool, ToolCallback, ToolError};
use crate::hash::{Hash, HashAlgorithm, HashStrategy, StreamHasher, digest_bytes};
use crate::humanize::ByteSize;
use crate::protocol::{
    MultipartSession, MultipartTarget, PartUpload, ProtocolHandlerResolver, ProtocolSettings,
    display_uri,
};
use crate::task::{
    AwsUploadPart, AwsUploadTaskConfiguration, GlacierUploadTaskOutput, S3Part, S3UploadTaskOutput,
    Task, TaskConfiguration, TaskOutput, TaskType,
};

const DEFAULT_CONCURRENCY: usize = 2;
const SKIP_BUFFER: usize = 64 * 1024;

/// What the part loop produced before completion
struct Uploaded {
    receipts: Vec<(u32, String)>,
    hashes: Vec<Hash>,
    total: u64,
}

/// Multipart upload of precomputed parts from one sequential read of the
/// source. Serves both the S3 and the Glacier upload task; the
/// [`MultipartTarget`] decides the service and its checksums.
pub struct AwsUploadTool {
    task_type: TaskType,
    resolver: Arc<ProtocolHandlerResolver>,
    target: Arc<dyn MultipartTarget>,
    /// Largest part held in memory at once
    part_limit: ByteSize,
}

impl AwsUploadTool {
    pub fn new(
        task_type: TaskType,
        resolver: Arc<ProtocolHandlerResolver>,
        target: Arc<dyn MultipartTarget>,
    ) -> Self {
        Self {
            task_type,
            resolver,
            target,
            part_limit: ProtocolSettings::default().max_buffer_bytes,
        }
    }

    pub fn with_part_limit(mut self, part_limit: ByteSize) -> Self {
        self.part_limit = part_limit;
        self
    }

    fn configuration<'a>(&self, task: &'a Task) -> Result<&'a AwsUploadTaskConfiguration, ToolError> {
        match (&task.configuration, self.task_type) {
            (TaskConfiguration::S3Upload(config), TaskType::S3Upload)
            | (TaskConfiguration::GlacierUpload(config), TaskType::GlacierUpload) => Ok(config),
            _ => Err(ToolError::mismatch(self.task_type, task)),
        }
    }

    /// Whole-content algorithms: the task's own list, then the service's
    /// native digest and its completion checksum, without repeats.
    fn whole_stream_algorithms(&self, config: &AwsUploadTaskConfiguration) -> Vec<HashAlgorithm> {
        let native = match self.task_type {
            TaskType::GlacierUpload => HashAlgorithm::TreeHash,
            _ => HashAlgorithm::Md5,
        };
        let mut algorithms = Vec::new();
        for algorithm in config
            .hash_algorithms
            .iter()
            .copied()
            .chain([native])
            .chain(self.target.completion_checksum())
        {
            if !algorithms.contains(&algorithm) {
                algorithms.push(algorithm);
            }
        }
        algorithms
    }

    async fn upload_parts(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        parts: &[AwsUploadPart],
        session: &mut dyn MultipartSession,
        algorithms: &[HashAlgorithm],
        callback: &ToolCallback,
    ) -> Result<Uploaded, String> {
        let strategies: Vec<HashStrategy> = algorithms.iter().copied().map(HashStrategy::whole).collect();
        let mut hasher = StreamHasher::new(&strategies);
        let mut receipts = Vec::with_capacity(parts.len());
        let mut skip = vec![0u8; SKIP_BUFFER];

        for part in parts {
            if part.offset < hasher.position() {
                return Err(format!(
                    "part {} starts at {} but the stream is already at {}",
                    part.number,
                    part.offset,
                    hasher.position()
                ));
            }

            // Gap bytes still count toward the whole-content digests
            while hasher.position() < part.offset {
                let want = (part.offset - hasher.position()).min(SKIP_BUFFER as u64) as usize;
                let read = reader
                    .read(&mut skip[..want])
                    .await
                    .map_err(|e| format!("read failed before part {}: {}", part.number, e))?;
                if read == 0 {
                    return Err(format!(
                        "source ended at {} before part {} at {}",
                        hasher.position(),
                        part.number,
                        part.offset
                    ));
                }
                hasher.update(&skip[..read]);
            }

            let mut body = vec![0u8; part.length as usize];
            reader.read_exact(&mut body).await.map_err(|e| {
                format!(
                    "could not read {} bytes of part {} at {}: {}",
                    part.length, part.number, part.offset, e
                )
            })?;
            hasher.update(&body);

            if let Some(expected) = &part.signing_hash {
                let actual = digest_bytes(HashAlgorithm::Sha256, &body);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(format!(
                        "part {} SHA-256 {} does not match the expected {}",
                        part.number, actual, expected
                    ));
                }
            }

            let checksum = part
                .part_hash
                .clone()
                .unwrap_or_else(|| digest_bytes(self.target.part_checksum(), &body));
            let receipt = session
                .upload_part(PartUpload {
                    number: part.number,
                    offset: part.offset,
                    body: Bytes::from(body),
                    checksum,
                })
                .await
                .map_err(|e| format!("part {}: {}", part.number, e))?;

            debug!(part = part.number, length = part.length, "Part uploaded");
            receipts.push((part.number, receipt));
            callback.progress((receipts.len() * 100 / parts.len()) as u8);
        }

        let total = hasher.position();
        Ok(Uploaded {
            receipts,
            hashes: hasher.finish(),
            total,
        })
    }

    fn output(&self, requested: &[HashAlgorithm], uploaded: Uploaded, location: Option<String>) -> TaskOutput {
        // The task's own list wins; without one every computed digest is reported
        let hashes: Vec<Hash> = if requested.is_empty() {
            uploaded.hashes
        } else {
            uploaded
                .hashes
                .into_iter()
                .filter(|hash| requested.contains(&hash.hash_algorithm))
                .collect()
        };

        match self.task_type {
            TaskType::GlacierUpload => TaskOutput::GlacierUpload(GlacierUploadTaskOutput { hashes, location }),
            _ => TaskOutput::S3Upload(S3UploadTaskOutput {
                parts: uploaded
                    .receipts
                    .into_iter()
                    .map(|(number, etag)| S3Part { number, etag })
                    .collect(),
                hashes,
                location,
            }),
        }
    }
}

#[async_trait]
impl Tool for AwsUploadTool {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let config = self.configuration(task)?;
        let parts = config.ordered_parts().map_err(ToolError::clean)?;
        if let Some(part) = parts.iter().find(|part| part.length > self.part_limit.as_u64()) {
            return Err(ToolError::Clean(format!(
                "part {} is {} bytes, above the {} buffer limit",
                part.number, part.length, self.part_limit
            )));
        }
        let destination = Url::parse(&config.destination)
            .map_err(|e| ToolError::Clean(format!("destination: {}", e)))?;
        let shown = display_uri(&config.destination);
        let algorithms = self.whole_stream_algorithms(config);

        let mut source = self
            .resolver
            .resolve_str(&config.source)
            .await
            .map_err(ToolError::clean)?;
        let mut reader = source.open_stream().await.map_err(ToolError::clean)?;

        let mut session = self
            .target
            .begin(&destination, config.part_size)
            .await
            .map_err(ToolError::clean)?;
        info!(task_id = %task.id, destination = %shown, parts = parts.len(), "Multipart upload started");

        let result = self
            .upload_parts(reader.as_mut(), &parts, session.as_mut(), &algorithms, callback)
            .await;
        let uploaded = match result {
            Ok(uploaded) => uploaded,
            Err(message) => return Err(abort(session.as_mut(), &shown, message).await),
        };
        drop(reader);
        if let Err(e) = source.close().await {
            warn!(task_id = %task.id, error = %e, "Failed to close upload source");
        }

        let checksum = self.target.completion_checksum().and_then(|algorithm| {
            uploaded
                .hashes
                .iter()
                .find(|hash| hash.hash_algorithm == algorithm)
                .map(|hash| hash.hash.clone())
        });
        let completed = session.complete(uploaded.total, checksum).await;
        let location = match completed {
            Ok(location) => location,
            Err(e) => return Err(abort(session.as_mut(), &shown, format!("completion failed: {}", e)).await),
        };

        info!(
            task_id = %task.id,
            destination = %shown,
            bytes = uploaded.total,
            "Multipart upload completed"
        );
        Ok(Some(self.output(&config.hash_algorithms, uploaded, location)))
    }
}

/// Abort the session; the failure is clean only if the abort went through
async fn abort(session: &mut dyn MultipartSession, destination: &str, message: String) -> ToolError {
    match session.abort().await {
        Ok(()) => {
            warn!(destination, reason = %message, "Multipart upload aborted");
            ToolError::Clean(message)
        }
        Err(e) => ToolError::Dirty(format!("{}; abort also failed: {}", message, e)),
    }
}
