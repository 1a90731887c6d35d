mod cli;

use clap::Parser;
use cli::{Cli, Commands, HashArgs, IngestArgs, WorkerArgs};
use mediaferry::config::Config;
use mediaferry::hash::{HashEngine, HashStrategy};
use mediaferry::observability::init_tracing;
use mediaferry::pipeline::PipelineState;
use mediaferry::pipeline::stages::ingest_pipeline;
use mediaferry::protocol::ProtocolHandlerResolver;
use mediaferry::runtime::Runtime;
use mediaferry::server::{self, AppState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Worker(args) => worker(config, args).await?,
        Commands::Hash(args) => hash(config, args).await?,
        Commands::Ingest(args) => ingest(config, args).await?,
    }

    Ok(())
}

async fn worker(config: Config, args: WorkerArgs) -> Result<(), BoxError> {
    let address = args.address.unwrap_or(config.server.bind_addr);
    let runtime = Runtime::open(config).await?;
    let shutdown = CancellationToken::new();

    let running = runtime.spawn(shutdown.clone());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            server::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server::run(address, AppState::from_runtime(&runtime), shutdown.clone()).await?;
    shutdown.cancel();
    running.await?;

    runtime.queue.flush()?;
    runtime.store.persist()?;
    info!("Worker shut down");
    Ok(())
}

async fn hash(config: Config, args: HashArgs) -> Result<(), BoxError> {
    let resolver = ProtocolHandlerResolver::with_defaults(&config.protocols.settings())?;
    let strategies: Vec<HashStrategy> = args
        .algorithms
        .iter()
        .map(|algorithm| HashStrategy::span(*algorithm, args.offset, args.length))
        .collect();

    let mut handler = resolver.resolve_str(&args.uri).await?;
    let mut reader = handler.open_stream().await?;
    let hashes = HashEngine::default().digest(&mut reader, &strategies).await?;
    if let Err(e) = handler.close().await {
        warn!(error = %e, "Failed to close source");
    }

    for hash in hashes {
        println!("{:<10} {}", hash.hash_algorithm, hash.hash);
    }
    Ok(())
}

async fn ingest(config: Config, args: IngestArgs) -> Result<(), BoxError> {
    let runtime = Runtime::open(config).await?;
    let shutdown = CancellationToken::new();
    let running = runtime.spawn(shutdown.clone());

    let mut events = runtime.engine.subscribe();
    let pipeline = ingest_pipeline(args.object_id.clone(), &args.transfers)?;
    let mut state = runtime.engine.start(pipeline).await?;
    let mut message = None;

    while !state.is_terminal() {
        tokio::select! {
            event = events.recv() => {
                let event = event?;
                if event.object_id == args.object_id {
                    state = event.state;
                    message = event.message;
                }
            }
            _ = server::shutdown_signal() => {
                warn!(object_id = %args.object_id, "Interrupted, pipeline will resume on next start");
                break;
            }
        }
    }

    shutdown.cancel();
    running.await?;
    runtime.queue.flush()?;
    runtime.store.persist()?;

    if let Some(record) = runtime.engine.record(&args.object_id)? {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    if state == PipelineState::Failed {
        let reason = message.unwrap_or_else(|| "no reason given".to_string());
        return Err(format!("pipeline {state}: {reason}").into());
    }
    Ok(())
}
