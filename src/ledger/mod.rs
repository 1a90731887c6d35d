/// Durable pipeline state.
///
/// The pipeline engine writes a [`JobRecord`] on every state transition so
/// an operator can see where each object is, and so active pipelines can be
/// picked up again after a restart. [`FjallStore`] keeps the records in an
/// embedded Fjall keyspace.
///
/// ## Usage
///
/// ```rust,ignore
/// use mediaferry::ledger::{FjallStore, JobStore};
///
/// let store = FjallStore::open("data/jobs")?;
/// let record = store.get("asset-42")?;
/// ```
pub mod error;
pub mod store;

pub use error::{LedgerError, Result};
pub use store::{FjallStore, StoreStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::PipelineState;

/// Snapshot of one pipeline, keyed by object id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub object_id: String,
    pub state: PipelineState,
    /// Remaining stages, current first
    pub stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_listener: Option<String>,
    /// Object description the pipeline was started with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Stage data
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Tasks dispatched by the current stage and not yet settled
    #[serde(default)]
    pub outstanding: Vec<Uuid>,
    /// Set once a stage has failed
    #[serde(default)]
    pub failing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status_timestamp: DateTime<Utc>,
}

/// Where pipeline records are kept
pub trait JobStore: Send + Sync {
    fn get(&self, object_id: &str) -> Result<Option<JobRecord>>;

    fn put(&self, record: &JobRecord) -> Result<()>;

    /// All records, in object id order
    fn list(&self) -> Result<Vec<JobRecord>>;
}
