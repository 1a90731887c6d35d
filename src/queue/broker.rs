use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{Delivery, QueueError, Result, TaskDispatcher, TaskQueue};
use crate::messaging::{CallbackHandler, TaskCallback};
use crate::observability::Metrics;
use crate::task::{Task, TaskType, should_retry};

/// TaskBroker fronts the task queue for producers and workers.
///
/// Producers enqueue through [`TaskDispatcher`]; idle workers wait on
/// [`TaskBroker::notified`] instead of polling. Terminal callbacks pass
/// through [`TaskBroker::settle`], which acknowledges the delivery and
/// decides between retry, dead letter and completion.
pub struct TaskBroker {
    queue: Arc<dyn TaskQueue>,
    notify: Notify,
    max_retries: i64,
    metrics: Arc<Metrics>,
}

impl TaskBroker {
    pub fn new(queue: Arc<dyn TaskQueue>, max_retries: i64, metrics: Arc<Metrics>) -> Self {
        info!(max_retries, "Creating TaskBroker");
        Self {
            queue,
            notify: Notify::new(),
            max_retries,
            metrics,
        }
    }

    pub fn enqueue(&self, task: &Task) -> Result<u64> {
        let seq = self.queue.enqueue(task)?;
        self.metrics.task_enqueued();
        self.notify.notify_one();
        Ok(seq)
    }

    pub fn dequeue(&self, accept: &dyn Fn(TaskType) -> bool) -> Result<Option<Delivery>> {
        self.queue.dequeue(accept)
    }

    /// Resolves when a task was enqueued since the last wake-up
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Wake a waiting consumer, e.g. after capacity was freed
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn pending(&self) -> Result<usize> {
        self.queue.pending()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Settle a callback against the queue.
    ///
    /// Returns the callback to forward downstream, or `None` when the failure
    /// was absorbed by a retry. Once the delivery is acknowledged the
    /// callback is always forwarded unless a retry was enqueued, even when
    /// the dead letter cannot be written.
    pub fn settle(&self, callback: TaskCallback) -> Result<Option<TaskCallback>> {
        if !callback.is_terminal() {
            return Ok(Some(callback));
        }

        let task = self
            .queue
            .acknowledge(callback.delivery)?
            .ok_or(QueueError::DeliveryNotFound(callback.delivery))?;
        let status = callback.update.status;

        if should_retry(status, task.retry_count, self.max_retries) {
            let retry = task.retried();
            match self.enqueue(&retry) {
                Ok(seq) => {
                    self.metrics.task_retried();
                    info!(
                        task_id = %task.id,
                        attempt = retry.retry_count,
                        seq,
                        %status,
                        "Task failed, retrying"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to enqueue retry, giving up");
                }
            }
        }

        if status.is_failure() {
            let reason = callback
                .update
                .message
                .clone()
                .unwrap_or_else(|| status.to_string());
            if let Err(e) = self.queue.dead_letter(callback.delivery, &task, &reason) {
                error!(task_id = %task.id, error = %e, %reason, "Failed to dead-letter task");
            }
            self.metrics.task_failed();
            self.metrics.task_dead_lettered();
            warn!(task_id = %task.id, attempts = task.retry_count + 1, %reason, "Task dead-lettered");
        } else {
            self.metrics.task_completed();
            debug!(task_id = %task.id, "Task completed");
        }
        Ok(Some(callback))
    }
}

impl TaskDispatcher for TaskBroker {
    fn dispatch(&self, task: Task) -> Result<u64> {
        self.enqueue(&task)
    }
}

/// Callback handler that settles each callback with the broker before
/// passing survivors on
pub struct Settling {
    broker: Arc<TaskBroker>,
    downstream: Arc<dyn CallbackHandler>,
}

impl Settling {
    pub fn new(broker: Arc<TaskBroker>, downstream: Arc<dyn CallbackHandler>) -> Self {
        Self { broker, downstream }
    }
}

#[async_trait]
impl CallbackHandler for Settling {
    async fn handle(&self, callback: TaskCallback) {
        let task_id = callback.task_id;
        match self.broker.settle(callback) {
            Ok(Some(callback)) => {
                self.broker.metrics.callback_delivered();
                self.downstream.handle(callback).await;
            }
            Ok(None) => {}
            Err(QueueError::DeliveryNotFound(seq)) => {
                warn!(%task_id, seq, "Callback for a delivery that is not in flight, dropping");
            }
            Err(e) => {
                warn!(%task_id, error = %e, "Failed to settle callback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::queue::FjallQueue;
    use crate::task::{HashInput, HashTaskConfiguration, TaskConfiguration, TaskStatusUpdate};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn hash_task() -> Task {
        Task::new(
            "hash",
            TaskConfiguration::Hash(HashTaskConfiguration {
                source: "file:///tmp/a".into(),
                hashes: vec![HashInput::whole(HashAlgorithm::Md5)],
            }),
        )
        .for_object("asset-1")
    }

    fn broker(temp: &TempDir, max_retries: i64) -> (Arc<FjallQueue>, TaskBroker) {
        let queue = Arc::new(FjallQueue::open(temp.path().join("queue")).unwrap());
        let broker = TaskBroker::new(queue.clone(), max_retries, Arc::new(Metrics::new()));
        (queue, broker)
    }

    fn deliver(broker: &TaskBroker) -> Delivery {
        broker.dequeue(&|_| true).unwrap().unwrap()
    }

    /// Fjall queue whose writes after the acknowledgement fail on request
    struct Unwritable {
        inner: FjallQueue,
        refuse_enqueue: AtomicBool,
        refuse_dead_letter: bool,
    }

    fn refused() -> QueueError {
        QueueError::Serialization(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
    }

    impl TaskQueue for Unwritable {
        fn enqueue(&self, task: &Task) -> Result<u64> {
            if self.refuse_enqueue.load(Ordering::SeqCst) {
                return Err(refused());
            }
            self.inner.enqueue(task)
        }

        fn dequeue(&self, accept: &dyn Fn(TaskType) -> bool) -> Result<Option<Delivery>> {
            self.inner.dequeue(accept)
        }

        fn acknowledge(&self, seq: u64) -> Result<Option<Task>> {
            self.inner.acknowledge(seq)
        }

        fn dead_letter(&self, seq: u64, task: &Task, reason: &str) -> Result<()> {
            if self.refuse_dead_letter {
                return Err(refused());
            }
            self.inner.dead_letter(seq, task, reason)
        }

        fn pending(&self) -> Result<usize> {
            self.inner.pending()
        }
    }

    fn unwritable_broker(
        temp: &TempDir,
        max_retries: i64,
        refuse_dead_letter: bool,
    ) -> (Arc<Unwritable>, Arc<TaskBroker>) {
        let queue = Arc::new(Unwritable {
            inner: FjallQueue::open(temp.path().join("queue")).unwrap(),
            refuse_enqueue: AtomicBool::new(false),
            refuse_dead_letter,
        });
        let broker = Arc::new(TaskBroker::new(queue.clone(), max_retries, Arc::new(Metrics::new())));
        (queue, broker)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TaskCallback>>);

    #[async_trait]
    impl CallbackHandler for Recorder {
        async fn handle(&self, callback: TaskCallback) {
            self.0.lock().unwrap().push(callback);
        }
    }

    #[test]
    fn test_progress_passes_through_without_settling() {
        let temp = TempDir::new().unwrap();
        let (queue, broker) = broker(&temp, 3);
        broker.enqueue(&hash_task()).unwrap();
        let delivery = deliver(&broker);

        let callback = TaskCallback::new(delivery.seq, &delivery.task, TaskStatusUpdate::progress(40));
        assert!(broker.settle(callback).unwrap().is_some());
        assert_eq!(queue.in_flight().unwrap(), 1);
    }

    #[test]
    fn test_failure_is_retried_until_bound() {
        let temp = TempDir::new().unwrap();
        let (queue, broker) = broker(&temp, 2);
        broker.enqueue(&hash_task()).unwrap();

        for attempt in 0..2 {
            let delivery = deliver(&broker);
            assert_eq!(delivery.task.retry_count, attempt);
            let failed = TaskStatusUpdate::failed_clean("connection reset");
            let callback = TaskCallback::new(delivery.seq, &delivery.task, failed);
            assert!(broker.settle(callback).unwrap().is_none());
        }

        let delivery = deliver(&broker);
        assert_eq!(delivery.task.retry_count, 2);
        let failed = TaskStatusUpdate::failed_dirty("partial write");
        let callback = TaskCallback::new(delivery.seq, &delivery.task, failed);
        let forwarded = broker.settle(callback).unwrap().unwrap();
        assert_eq!(forwarded.attempt, 2);

        let dead = queue.get_dlq_task(delivery.seq).unwrap().unwrap();
        assert_eq!(dead.reason, "partial write");
        assert_eq!(dead.attempts, 3);
        assert_eq!(queue.pending().unwrap(), 0);

        let snapshot = broker.metrics().snapshot();
        assert_eq!(snapshot.tasks_retried, 2);
        assert_eq!(snapshot.tasks_dead_lettered, 1);
    }

    #[test]
    fn test_success_is_acknowledged_once() {
        let temp = TempDir::new().unwrap();
        let (queue, broker) = broker(&temp, 3);
        broker.enqueue(&hash_task()).unwrap();
        let delivery = deliver(&broker);

        let callback = TaskCallback::new(delivery.seq, &delivery.task, TaskStatusUpdate::completed(None));
        assert!(broker.settle(callback.clone()).unwrap().is_some());
        assert_eq!(queue.in_flight().unwrap(), 0);

        assert!(matches!(
            broker.settle(callback),
            Err(QueueError::DeliveryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settling_forwards_only_final_outcomes() {
        let temp = TempDir::new().unwrap();
        let (_queue, broker) = broker(&temp, 1);
        let broker = Arc::new(broker);
        let recorder = Arc::new(Recorder::default());
        let settling = Settling::new(broker.clone(), recorder.clone());

        broker.dispatch(hash_task()).unwrap();
        let first = deliver(&broker);
        settling
            .handle(TaskCallback::new(first.seq, &first.task, TaskStatusUpdate::failed_clean("timeout")))
            .await;
        assert!(recorder.0.lock().unwrap().is_empty());

        let second = deliver(&broker);
        settling
            .handle(TaskCallback::new(second.seq, &second.task, TaskStatusUpdate::completed(None)))
            .await;

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].attempt, 1);
        assert_eq!(seen[0].task_id, first.task.id);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_consumer() {
        let temp = TempDir::new().unwrap();
        let (_queue, broker) = broker(&temp, 0);
        let broker = Arc::new(broker);

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.notified().await })
        };
        tokio::task::yield_now().await;
        broker.enqueue(&hash_task()).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_dead_letter_still_reaches_pipeline() {
        let temp = TempDir::new().unwrap();
        let (queue, broker) = unwritable_broker(&temp, 0, true);
        let recorder = Arc::new(Recorder::default());
        let settling = Settling::new(broker.clone(), recorder.clone());

        broker.enqueue(&hash_task()).unwrap();
        let delivery = deliver(&broker);
        settling
            .handle(TaskCallback::new(
                delivery.seq,
                &delivery.task,
                TaskStatusUpdate::failed_dirty("bad disk"),
            ))
            .await;

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].update.status.is_failure());
        assert_eq!(queue.inner.in_flight().unwrap(), 0);
    }

    #[test]
    fn test_failed_retry_enqueue_forwards_failure() {
        let temp = TempDir::new().unwrap();
        let (queue, broker) = unwritable_broker(&temp, 3, false);
        broker.enqueue(&hash_task()).unwrap();
        let delivery = deliver(&broker);

        queue.refuse_enqueue.store(true, Ordering::SeqCst);
        let failed = TaskStatusUpdate::failed_clean("connection reset");
        let callback = TaskCallback::new(delivery.seq, &delivery.task, failed);
        let forwarded = broker.settle(callback).unwrap();

        assert!(forwarded.is_some());
        assert_eq!(queue.inner.pending().unwrap(), 0);
        assert!(queue.inner.get_dlq_task(delivery.seq).unwrap().is_some());
        assert_eq!(broker.metrics().snapshot().tasks_retried, 0);
    }
}
