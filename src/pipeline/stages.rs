//! Stages for ingesting media: copy, verify the copies, and clean up after
//! a failure.
//!
//! All three read the pipeline's transfer list from the `transfers` data key
//! (a list of [`TransferInstruction`]s).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{Pipeline, PipelineContext, PipelineStage, Result, StageRegistry, StageResult};
use crate::hash::{Hash, HashAlgorithm};
use crate::messaging::TaskCallback;
use crate::protocol::display_uri;
use crate::task::{
    ContentInfo, DeleteTaskConfiguration, HashInput, HashTaskConfiguration, Task,
    TaskConfiguration, TaskOutput, TransferInstruction, TransferTaskConfiguration,
};

pub const TRANSFER: &str = "transfer";
pub const VERIFY: &str = "verify";
pub const CLEANUP: &str = "cleanup";

/// Data key holding the transfer list
pub const TRANSFERS: &str = "transfers";
/// Data key holding what the transfer stage reported
pub const CONTENTS: &str = "contents";
const EXPECTED: &str = "verify_expected";

/// Registry with every stage in this module
pub fn standard_stages() -> StageRegistry {
    StageRegistry::new()
        .register(Arc::new(TransferStage))
        .register(Arc::new(VerifyStage))
        .register(Arc::new(CleanupStage))
}

/// Copy `transfers`, verify remote copies, and delete every destination if
/// anything fails
pub fn ingest_pipeline(object_id: impl Into<String>, transfers: &[TransferInstruction]) -> Result<Pipeline> {
    Pipeline::new(object_id, [TRANSFER])
        .with_failure_stage(CLEANUP)
        .with_data(TRANSFERS, &transfers)
}

fn failure_message(callback: &TaskCallback) -> String {
    callback
        .update
        .message
        .clone()
        .unwrap_or_else(|| format!("{} task {}", callback.task_type, callback.update.status))
}

fn transfers(context: &PipelineContext) -> Result<Vec<TransferInstruction>> {
    Ok(context.get(TRANSFERS)?.unwrap_or_default())
}

fn has_scheme(uri: &str, scheme: &str) -> bool {
    Url::parse(uri).is_ok_and(|url| url.scheme().eq_ignore_ascii_case(scheme))
}

fn is_local(uri: &str) -> bool {
    has_scheme(uri, "file")
}

/// Dispatches one transfer task for the whole list
pub struct TransferStage;

#[async_trait]
impl PipelineStage for TransferStage {
    fn name(&self) -> &'static str {
        TRANSFER
    }

    async fn prepare(&self, context: &mut PipelineContext) -> Result<StageResult> {
        let transfers = transfers(context)?;
        if transfers.is_empty() {
            return Ok(StageResult::Failed("nothing to transfer".to_string()));
        }

        if transfers.iter().any(|t| !is_local(&t.destination)) {
            context.insert_stage_after_current(VERIFY);
        }
        let task = Task::new(
            format!("transfer {}", context.object_id()),
            TaskConfiguration::Transfer(TransferTaskConfiguration { transfers }),
        );
        context.dispatch(task)?;
        Ok(StageResult::AwaitCallback)
    }

    async fn on_callback(
        &self,
        context: &mut PipelineContext,
        callback: &TaskCallback,
    ) -> Result<StageResult> {
        if callback.update.status.is_failure() {
            return Ok(StageResult::Failed(failure_message(callback)));
        }
        let Some(TaskOutput::Transfer(output)) = &callback.update.output else {
            return Ok(StageResult::Failed("transfer reported no contents".to_string()));
        };

        context.set(CONTENTS, &output.contents)?;
        info!(object_id = %context.object_id(), count = output.contents.len(), "Transfer complete");
        Ok(StageResult::Complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Expected {
    destination: String,
    md5: Hash,
}

/// Re-reads each destination and compares its MD5 with the one recorded
/// while copying
pub struct VerifyStage;

#[async_trait]
impl PipelineStage for VerifyStage {
    fn name(&self) -> &'static str {
        VERIFY
    }

    async fn prepare(&self, context: &mut PipelineContext) -> Result<StageResult> {
        let contents: Vec<ContentInfo> = context.get(CONTENTS)?.unwrap_or_default();
        let mut expected = BTreeMap::new();

        for content in contents {
            // Archives are only readable through a retrieval job
            if has_scheme(&content.destination, "glacier") {
                debug!(destination = %display_uri(&content.destination), "Archive copy not re-read");
                continue;
            }
            let Some(md5) = content
                .hashes
                .iter()
                .find(|h| h.hash_algorithm == HashAlgorithm::Md5)
                .cloned()
            else {
                return Ok(StageResult::Failed(format!(
                    "no MD5 recorded for {}",
                    content.destination
                )));
            };
            let task = Task::new(
                format!("verify {}", context.object_id()),
                TaskConfiguration::Hash(HashTaskConfiguration {
                    source: content.destination.clone(),
                    hashes: vec![HashInput::whole(HashAlgorithm::Md5)],
                }),
            );
            let id = context.dispatch(task)?;
            expected.insert(id, Expected {
                destination: content.destination,
                md5,
            });
        }

        if expected.is_empty() {
            return Ok(StageResult::Complete);
        }
        context.set(EXPECTED, &expected)?;
        Ok(StageResult::AwaitCallback)
    }

    async fn on_callback(
        &self,
        context: &mut PipelineContext,
        callback: &TaskCallback,
    ) -> Result<StageResult> {
        if callback.update.status.is_failure() {
            return Ok(StageResult::Failed(failure_message(callback)));
        }
        let expected: BTreeMap<Uuid, Expected> = context.get(EXPECTED)?.unwrap_or_default();
        let Some(expected) = expected.get(&callback.task_id) else {
            return Ok(StageResult::Failed(format!(
                "unexpected verification result for task {}",
                callback.task_id
            )));
        };

        let actual = match &callback.update.output {
            Some(TaskOutput::Hash(output)) => output
                .hashes
                .iter()
                .find(|h| h.hash_algorithm == HashAlgorithm::Md5),
            _ => None,
        };
        match actual {
            Some(actual) if actual.matches(&expected.md5) => {
                debug!(destination = %expected.destination, "Checksum verified");
            }
            Some(actual) => {
                return Ok(StageResult::Failed(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    expected.destination, expected.md5.hash, actual.hash
                )));
            }
            None => {
                return Ok(StageResult::Failed(format!(
                    "no MD5 reported for {}",
                    expected.destination
                )));
            }
        }

        if context.outstanding() == 0 {
            Ok(StageResult::Complete)
        } else {
            Ok(StageResult::AwaitCallback)
        }
    }
}

/// Failure stage: deletes what the transfer reported writing, or every
/// requested destination when nothing was reported
pub struct CleanupStage;

#[async_trait]
impl PipelineStage for CleanupStage {
    fn name(&self) -> &'static str {
        CLEANUP
    }

    async fn prepare(&self, context: &mut PipelineContext) -> Result<StageResult> {
        let written: Vec<ContentInfo> = context.get(CONTENTS)?.unwrap_or_default();
        let locations: Vec<String> = if written.is_empty() {
            transfers(context)?.into_iter().map(|t| t.destination).collect()
        } else {
            written.into_iter().map(|c| c.destination).collect()
        };
        if locations.is_empty() {
            return Ok(StageResult::Complete);
        }

        let task = Task::new(
            format!("cleanup {}", context.object_id()),
            TaskConfiguration::Delete(DeleteTaskConfiguration { locations }),
        );
        context.dispatch(task)?;
        Ok(StageResult::AwaitCallback)
    }

    async fn on_callback(
        &self,
        _context: &mut PipelineContext,
        callback: &TaskCallback,
    ) -> Result<StageResult> {
        if callback.update.status.is_failure() {
            return Ok(StageResult::Failed(failure_message(callback)));
        }
        Ok(StageResult::Complete)
    }
}
