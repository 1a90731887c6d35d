use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use super::{Tool, ToolCallback, ToolError};
use crate::hash::Hash;
use crate::humanize::ByteSize;
use crate::protocol::{ProtocolHandlerResolver, display_uri};
use crate::task::{ManifestFile, ManifestParseTaskOutput, Task, TaskConfiguration, TaskOutput, TaskType};

const DEFAULT_CONCURRENCY: usize = 4;

/// Largest manifest document accepted
pub const MANIFEST_LIMIT: ByteSize = ByteSize(16 * 1024 * 1024);

#[derive(Debug, Deserialize)]
struct Manifest {
    files: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    path: String,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    hashes: Vec<Hash>,
}

/// Reads a JSON manifest and lists its files as URIs relative to the
/// manifest's own location.
pub struct ManifestParseTool {
    resolver: Arc<ProtocolHandlerResolver>,
}

impl ManifestParseTool {
    pub fn new(resolver: Arc<ProtocolHandlerResolver>) -> Self {
        Self { resolver }
    }
}

/// Resolve manifest entries against `base`
fn resolve_entries(base: &Url, manifest: Manifest) -> Result<Vec<ManifestFile>, String> {
    manifest
        .files
        .into_iter()
        .map(|entry| {
            let uri = base
                .join(&entry.path)
                .map_err(|e| format!("manifest entry `{}`: {}", entry.path, e))?;
            Ok(ManifestFile {
                uri: uri.to_string(),
                length: entry.length,
                hashes: entry.hashes,
            })
        })
        .collect()
}

#[async_trait]
impl Tool for ManifestParseTool {
    fn task_type(&self) -> TaskType {
        TaskType::ManifestParse
    }

    fn max_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }

    async fn run(&self, task: &Task, _callback: &ToolCallback) -> Result<Option<TaskOutput>, ToolError> {
        let TaskConfiguration::ManifestParse(config) = &task.configuration else {
            return Err(ToolError::mismatch(self.task_type(), task));
        };
        let shown = display_uri(&config.source);
        let base = Url::parse(&config.source)
            .map_err(|e| ToolError::Clean(format!("source: {}", e)))?;

        let mut handler = self.resolver.resolve(&base).await.map_err(ToolError::clean)?;
        let reader = handler.open_stream().await.map_err(ToolError::clean)?;

        let mut document = Vec::new();
        reader
            .take(MANIFEST_LIMIT.as_u64() + 1)
            .read_to_end(&mut document)
            .await
            .map_err(|e| ToolError::Clean(format!("{}: {}", shown, e)))?;
        if document.len() as u64 > MANIFEST_LIMIT.as_u64() {
            return Err(ToolError::Clean(format!(
                "{}: manifest exceeds {}",
                shown, MANIFEST_LIMIT
            )));
        }
        handler.close().await.map_err(ToolError::clean)?;

        let manifest: Manifest = serde_json::from_slice(&document)
            .map_err(|e| ToolError::Clean(format!("{}: malformed manifest: {}", shown, e)))?;
        let files = resolve_entries(&base, manifest).map_err(ToolError::Clean)?;

        debug!(task_id = %task.id, files = files.len(), "Manifest parsed");
        Ok(Some(TaskOutput::ManifestParse(ManifestParseTaskOutput { files })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::task::{ManifestParseTaskConfiguration, TaskStatus};
    use crate::tools::testing;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn manifest_task(source: String) -> Task {
        Task::new(
            "manifest",
            TaskConfiguration::ManifestParse(ManifestParseTaskConfiguration { source }),
        )
    }

    #[tokio::test]
    async fn test_entries_resolve_against_manifest_location() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("delivery");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = dir.join("manifest.json");
        std::fs::write(
            &manifest,
            r#"{"files": [
                {"path": "reel1.mov", "length": 1024,
                 "hashes": [{"hash_algorithm": "MD5", "hash": "abc"}]},
                {"path": "audio/stems.wav"}
            ]}"#,
        )
        .unwrap();

        let tool = ManifestParseTool::new(testing::resolver(Arc::new(InMemory::new())));
        let source = Url::from_file_path(&manifest).unwrap();
        let update = testing::execute(&tool, manifest_task(source.to_string())).await;

        assert_eq!(update.status, TaskStatus::Completed);
        let Some(TaskOutput::ManifestParse(output)) = update.output else {
            panic!("expected manifest output");
        };
        assert_eq!(output.files.len(), 2);
        assert_eq!(output.files[0].uri, source.join("reel1.mov").unwrap().to_string());
        assert_eq!(output.files[0].length, Some(1024));
        assert_eq!(output.files[0].hashes[0].hash_algorithm, HashAlgorithm::Md5);
        assert!(output.files[1].uri.ends_with("/delivery/audio/stems.wav"));
        assert!(output.files[1].hashes.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_manifest_fails_clean() {
        let temp = TempDir::new().unwrap();
        let manifest = temp.path().join("manifest.json");
        std::fs::write(&manifest, b"{\"files\": [{\"length\": 3}]}").unwrap();

        let tool = ManifestParseTool::new(testing::resolver(Arc::new(InMemory::new())));
        let source = Url::from_file_path(&manifest).unwrap().to_string();
        let update = testing::execute(&tool, manifest_task(source)).await;

        assert_eq!(update.status, TaskStatus::FailedClean);
        assert!(update.message.unwrap().contains("malformed manifest"));
    }
}
