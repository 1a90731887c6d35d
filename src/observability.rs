//! Metrics counters and tracing setup

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Process-wide task counters
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_enqueued: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_dead_lettered: AtomicU64,
    callbacks_delivered: AtomicU64,
    pipelines_completed: AtomicU64,
    pipelines_failed: AtomicU64,
}

macro_rules! counter {
    ($method:ident, $field:ident) => {
        pub fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter = stringify!($field), "Metric incremented");
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(task_enqueued, tasks_enqueued);
    counter!(task_dispatched, tasks_dispatched);
    counter!(task_completed, tasks_completed);
    counter!(task_failed, tasks_failed);
    counter!(task_retried, tasks_retried);
    counter!(task_dead_lettered, tasks_dead_lettered);
    counter!(callback_delivered, callbacks_delivered);
    counter!(pipeline_completed, pipelines_completed);
    counter!(pipeline_failed, pipelines_failed);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::Relaxed),
            callbacks_delivered: self.callbacks_delivered.load(Ordering::Relaxed),
            pipelines_completed: self.pipelines_completed.load(Ordering::Relaxed),
            pipelines_failed: self.pipelines_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub callbacks_delivered: u64,
    pub pipelines_completed: u64,
    pub pipelines_failed: u64,
}

/// Install the global subscriber; `RUST_LOG` overrides the `info` default.
/// Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = Metrics::new();
        metrics.task_dispatched();
        metrics.task_dispatched();
        metrics.task_retried();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_dispatched, 2);
        assert_eq!(snapshot.tasks_retried, 1);
        assert_eq!(snapshot.tasks_completed, 0);
    }
}
