//! Runtime tests: queue, worker, tools and pipelines together over local
//! files and an in-memory object store.

use mediaferry::config::Config;
use mediaferry::hash::HashAlgorithm;
use mediaferry::pipeline::stages::ingest_pipeline;
use mediaferry::pipeline::{PipelineEvent, PipelineState};
use mediaferry::protocol::object::ObjectStoreHandler;
use mediaferry::protocol::{ProtocolHandlerResolver, factory};
use mediaferry::runtime::Runtime;
use mediaferry::task::{
    HashInput, HashTaskConfiguration, Task, TaskConfiguration, TransferInstruction,
};
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

fn file_uri(path: &Path) -> String {
    Url::from_file_path(path).unwrap().to_string()
}

fn resolver(memory: Arc<InMemory>) -> Arc<ProtocolHandlerResolver> {
    let mut resolver = ProtocolHandlerResolver::new();
    resolver.register("file", factory(ObjectStoreHandler::local));
    resolver.register(
        "mem",
        factory(move || ObjectStoreHandler::keyed("mem", memory.clone())),
    );
    Arc::new(resolver)
}

async fn runtime(temp: &TempDir, memory: Arc<InMemory>, max_retries: i64) -> Runtime {
    let mut config = Config::default();
    config.queue.path = temp.path().join("queue");
    config.queue.max_retries = max_retries;
    config.queue.poll_interval_ms = 10;
    config.store.path = temp.path().join("jobs");
    Runtime::with_resolver(config, resolver(memory)).await.unwrap()
}

async fn wait_for(events: &mut broadcast::Receiver<PipelineEvent>, object_id: &str) -> PipelineEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.object_id == object_id {
                return event;
            }
        }
    })
    .await
    .expect("pipeline did not finish")
}

#[tokio::test]
async fn test_ingest_copies_and_verifies() {
    let temp = TempDir::new().unwrap();
    let memory = Arc::new(InMemory::new());
    let runtime = runtime(&temp, memory.clone(), 0).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let source = temp.path().join("reel1.mov");
    std::fs::write(&source, &payload).unwrap();
    let archive = temp.path().join("archive").join("reel1.mov");

    let shutdown = CancellationToken::new();
    let running = runtime.spawn(shutdown.clone());
    let mut events = runtime.engine.subscribe();

    let transfers = [
        TransferInstruction {
            source: file_uri(&source),
            destination: file_uri(&archive),
        },
        TransferInstruction {
            source: file_uri(&source),
            destination: "mem://bucket/reel1.mov".into(),
        },
    ];
    let state = runtime
        .engine
        .start(ingest_pipeline("asset-1", &transfers).unwrap())
        .await
        .unwrap();
    assert_eq!(state, PipelineState::AwaitingCallback);

    let event = wait_for(&mut events, "asset-1").await;
    assert_eq!(event.state, PipelineState::Completed, "{:?}", event.message);

    assert_eq!(std::fs::read(&archive).unwrap(), payload);
    let stored = memory
        .get(&StorePath::from("bucket/reel1.mov"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(stored.as_ref(), payload.as_slice());

    let record = runtime.engine.record("asset-1").unwrap().unwrap();
    assert_eq!(record.state, PipelineState::Completed);
    assert!(record.outstanding.is_empty());

    shutdown.cancel();
    running.await.unwrap();

    let metrics = runtime.metrics.snapshot();
    // one transfer plus a verification hash per destination
    assert_eq!(metrics.tasks_completed, 3);
    assert_eq!(metrics.pipelines_completed, 1);
    assert_eq!(runtime.queue.in_flight().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_transfer_cleans_up() {
    let temp = TempDir::new().unwrap();
    let memory = Arc::new(InMemory::new());
    let runtime = runtime(&temp, memory.clone(), 0).await;

    let shutdown = CancellationToken::new();
    let running = runtime.spawn(shutdown.clone());
    let mut events = runtime.engine.subscribe();

    let transfers = [TransferInstruction {
        source: file_uri(&temp.path().join("missing.mov")),
        destination: "mem://bucket/missing.mov".into(),
    }];
    runtime
        .engine
        .start(ingest_pipeline("asset-2", &transfers).unwrap())
        .await
        .unwrap();

    let event = wait_for(&mut events, "asset-2").await;
    assert_eq!(event.state, PipelineState::Failed);
    assert!(event.message.is_some());

    let record = runtime.engine.record("asset-2").unwrap().unwrap();
    assert_eq!(record.state, PipelineState::Failed);
    assert_eq!(record.failure_stage.as_deref(), Some("cleanup"));

    shutdown.cancel();
    running.await.unwrap();

    assert!(memory.head(&StorePath::from("bucket/missing.mov")).await.is_err());
    let dead = runtime.queue.list_dlq(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].1.attempts, 1);
    assert_eq!(runtime.metrics.snapshot().pipelines_failed, 1);
}

#[tokio::test]
async fn test_failed_task_is_retried_then_dead_lettered() {
    let temp = TempDir::new().unwrap();
    let runtime = runtime(&temp, Arc::new(InMemory::new()), 2).await;

    let task = Task::new(
        "hash missing",
        TaskConfiguration::Hash(HashTaskConfiguration {
            source: file_uri(&temp.path().join("missing.mov")),
            hashes: vec![HashInput::whole(HashAlgorithm::Md5)],
        }),
    );
    runtime.broker.enqueue(&task).unwrap();

    let shutdown = CancellationToken::new();
    let running = runtime.spawn(shutdown.clone());

    let dead = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let dead = runtime.queue.list_dlq(10).unwrap();
            if !dead.is_empty() {
                return dead;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task was not dead-lettered");

    shutdown.cancel();
    running.await.unwrap();

    assert_eq!(dead[0].1.attempts, 3);
    let metrics = runtime.metrics.snapshot();
    assert_eq!(metrics.tasks_retried, 2);
    assert_eq!(metrics.tasks_dead_lettered, 1);
    assert_eq!(runtime.broker.pending().unwrap(), 0);
}
