use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::{DeadLetter, Delivery, Result, TaskQueue};
use crate::task::{Task, TaskType, queue_priority};

const NEXT_SEQ: &[u8] = b"next_seq";

/// Key order is priority rank (0 = most urgent) then sequence
fn task_key(rank: u8, seq: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = rank;
    key[1..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn seq_of(key: &[u8]) -> u64 {
    let tail = if key.len() == 9 { &key[1..] } else { key };
    u64::from_be_bytes(tail.try_into().unwrap_or([0u8; 8]))
}

/// Rank byte for a task; the queue's native priority counts the other way
fn rank(task: &Task) -> Result<u8> {
    Ok(9 - queue_priority(task.priority as i64)?)
}

/// FjallQueue persists tasks, in-flight deliveries and dead letters in one
/// Fjall keyspace.
///
/// Partitions:
/// - `tasks`: `[rank][seq be]` → task JSON, waiting
/// - `inflight`: `seq be` → task JSON, delivered but not acknowledged
/// - `dlq`: `seq be` → [`DeadLetter`] JSON
/// - `metadata`: `next_seq` → u64
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    inflight: PartitionHandle,
    dlq: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: Arc<AtomicU64>,
    dequeue_lock: Mutex<()>,
}

impl FjallQueue {
    /// Open or create a queue at `path`. Deliveries left in flight by a
    /// previous process are put back in line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening FjallQueue at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;
        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let inflight = keyspace.open_partition("inflight", PartitionCreateOptions::default())?;
        let dlq = keyspace.open_partition("dlq", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(NEXT_SEQ)?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        let queue = Self {
            keyspace,
            tasks,
            inflight,
            dlq,
            metadata,
            seq_counter: Arc::new(AtomicU64::new(current_seq)),
            dequeue_lock: Mutex::new(()),
        };
        let requeued = queue.requeue_inflight()?;

        info!(current_seq, requeued, "FjallQueue opened");
        Ok(queue)
    }

    fn requeue_inflight(&self) -> Result<usize> {
        let mut batch = self.keyspace.batch();
        let mut count = 0;

        for item in self.inflight.iter() {
            let (key, value) = item?;
            let seq = seq_of(&key);
            let task = Task::from_json(&String::from_utf8_lossy(&value))?;
            batch.insert(&self.tasks, task_key(rank(&task)?, seq), value.to_vec());
            batch.remove(&self.inflight, key.to_vec());
            count += 1;
        }

        batch.commit()?;
        if count > 0 {
            warn!(count, "Re-queued unacknowledged deliveries");
        }
        Ok(count)
    }

    fn dead_letter_raw(&self, seq: u64, task: Value, reason: &str, attempts: u32) -> Result<()> {
        let entry = DeadLetter {
            task,
            reason: reason.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        self.dlq.insert(seq.to_be_bytes(), serde_json::to_vec(&entry)?)?;
        info!(seq, attempts, "Task moved to DLQ");
        Ok(())
    }

    pub fn get_dlq_task(&self, seq: u64) -> Result<Option<DeadLetter>> {
        match self.dlq.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List DLQ tasks (for debugging/inspection)
    pub fn list_dlq(&self, limit: usize) -> Result<Vec<(u64, DeadLetter)>> {
        let mut results = Vec::new();
        for item in self.dlq.iter().take(limit) {
            let (key, value) = item?;
            results.push((seq_of(&key), serde_json::from_slice(&value)?));
        }
        Ok(results)
    }

    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.inflight.len()?)
    }

    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(NEXT_SEQ)?;
        Ok(())
    }
}

impl TaskQueue for FjallQueue {
    fn enqueue(&self, task: &Task) -> Result<u64> {
        let rank = rank(task)?;
        let value = task.to_json()?;
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);

        let mut batch = self.keyspace.batch();
        batch.insert(&self.tasks, task_key(rank, seq), value.into_bytes());
        batch.insert(&self.metadata, NEXT_SEQ, (seq + 1).to_be_bytes());
        batch.commit()?;

        debug!(seq, task_id = %task.id, priority = task.priority, "Task enqueued");
        Ok(seq)
    }

    fn dequeue(&self, accept: &dyn Fn(TaskType) -> bool) -> Result<Option<Delivery>> {
        // Scan and move must not interleave with another consumer
        let _guard = self.dequeue_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for item in self.tasks.iter() {
            let (key, value) = item?;
            let seq = seq_of(&key);

            let task = match Task::from_json(&String::from_utf8_lossy(&value)) {
                Ok(task) => task,
                Err(e) => {
                    error!(seq, error = %e, "Undecodable task moved to DLQ");
                    let raw = Value::String(String::from_utf8_lossy(&value).into_owned());
                    self.dead_letter_raw(seq, raw, &e.to_string(), 0)?;
                    self.tasks.remove(key.to_vec())?;
                    continue;
                }
            };
            if !accept(task.task_type()) {
                continue;
            }

            let mut batch = self.keyspace.batch();
            batch.remove(&self.tasks, key.to_vec());
            batch.insert(&self.inflight, seq.to_be_bytes(), value.to_vec());
            batch.commit()?;

            debug!(seq, task_id = %task.id, "Task delivered");
            return Ok(Some(Delivery { seq, task }));
        }

        Ok(None)
    }

    fn acknowledge(&self, seq: u64) -> Result<Option<Task>> {
        let key = seq.to_be_bytes();
        let Some(value) = self.inflight.get(key)? else {
            return Ok(None);
        };
        self.inflight.remove(key)?;
        debug!(seq, "Delivery acknowledged");
        Ok(Some(Task::from_json(&String::from_utf8_lossy(&value))?))
    }

    fn dead_letter(&self, seq: u64, task: &Task, reason: &str) -> Result<()> {
        let value: Value = serde_json::from_str(&task.to_json()?)?;
        self.dead_letter_raw(seq, value, reason, task.retry_count + 1)
    }

    fn pending(&self) -> Result<usize> {
        Ok(self.tasks.len()?)
    }
}
