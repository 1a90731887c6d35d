use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use super::error::Result;
use super::{JobRecord, JobStore};

/// Encode a job key: job:{object_id}
fn encode_job_key(object_id: &str) -> Vec<u8> {
    format!("job:{}", object_id).into_bytes()
}

/// Fjall-backed persistent storage for pipeline records
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
}

impl FjallStore {
    /// Open or create a Fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening Fjall store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;

        info!("Fjall store opened successfully");
        Ok(Self { keyspace, jobs })
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Get internal statistics (for debugging/monitoring)
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for record in self.list()? {
            stats.job_count += 1;
            if record.state.is_terminal() {
                stats.finished_count += 1;
            }
        }
        Ok(stats)
    }
}

impl JobStore for FjallStore {
    fn get(&self, object_id: &str) -> Result<Option<JobRecord>> {
        match self.jobs.get(encode_job_key(object_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: &JobRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.jobs.insert(encode_job_key(&record.object_id), value)?;
        debug!(object_id = %record.object_id, state = ?record.state, "Stored job record");
        Ok(())
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub job_count: usize,
    pub finished_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineState;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (FjallStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallStore::open(temp_dir.path().join("test_jobs")).unwrap();
        (store, temp_dir)
    }

    fn create_test_record(object_id: &str, state: PipelineState) -> JobRecord {
        let mut data = serde_json::Map::new();
        data.insert("transfers".into(), json!([]));
        JobRecord {
            object_id: object_id.to_string(),
            state,
            stages: vec!["transfer".into(), "verify".into()],
            failure_stage: Some("cleanup".into()),
            callback_listener: Some("ingest-ui".into()),
            object: Some(json!({"title": "Reel 1"})),
            data,
            outstanding: vec![uuid::Uuid::now_v7()],
            failing: false,
            message: None,
            status_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_put_and_get_record() {
        let (store, _temp) = create_test_store();
        let record = create_test_record("asset-1", PipelineState::AwaitingCallback);

        store.put(&record).unwrap();
        assert_eq!(store.get("asset-1").unwrap(), Some(record));
    }

    #[test]
    fn test_get_nonexistent_record() {
        let (store, _temp) = create_test_store();
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_put_overwrites() {
        let (store, _temp) = create_test_store();
        let mut record = create_test_record("asset-1", PipelineState::AwaitingCallback);
        store.put(&record).unwrap();

        record.state = PipelineState::Completed;
        record.stages.clear();
        store.put(&record).unwrap();

        let stored = store.get("asset-1").unwrap().unwrap();
        assert_eq!(stored.state, PipelineState::Completed);
        assert!(stored.stages.is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let (store, _temp) = create_test_store();
        store
            .put(&create_test_record("a", PipelineState::AwaitingCallback))
            .unwrap();
        store.put(&create_test_record("b", PipelineState::Failed)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.job_count, 2);
        assert_eq!(stats.finished_count, 1);
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test_jobs");
        {
            let store = FjallStore::open(&path).unwrap();
            store
                .put(&create_test_record("asset-9", PipelineState::Preparing))
                .unwrap();
            store.persist().unwrap();
        }

        let store = FjallStore::open(&path).unwrap();
        assert_eq!(
            store.get("asset-9").unwrap().unwrap().state,
            PipelineState::Preparing
        );
    }
}
