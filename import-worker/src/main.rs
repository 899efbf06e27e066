//! Admit import chunks into the pipeline and record the outcome of every imported record.
use std::path::Path;
use std::sync::Arc;

use envconfig::Envconfig;
use import_common::chunks::ChunkTracker;
use import_common::consumer::ConsumerRegistry;
use import_common::flow_control::FlowControl;
use import_common::journal::JournalAccumulator;
use import_common::kafka::{create_kafka_producer, TopicConsumer};
use import_common::metrics::{serve, setup_metrics_routes};
use import_common::progress::ProgressAccumulator;
use import_common::retry::RetryPolicy;
use import_common::signals::PipelineSignals;
use import_common::storage::postgres::PgStore;
use import_worker::config::Config;
use import_worker::error::WorkerError;
use import_worker::router::{app, AppState};
use import_worker::worker::{CompletionWorker, IngestionWorker};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;

    let store = Arc::new(
        PgStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to connect to database"),
    );
    if let Some(migrations_path) = &config.migrations_path {
        store.migrate(Path::new(migrations_path)).await?;
    }

    // Consumers stop first, so that everything they signalled still reaches the dispatchers.
    let consumers_shutdown = CancellationToken::new();
    let dispatchers_shutdown = CancellationToken::new();

    let (progress, progress_loop) =
        ProgressAccumulator::spawn(store.clone(), &config.dispatcher, dispatchers_shutdown.clone());
    let (journal, journal_loop) =
        JournalAccumulator::spawn(store.clone(), &config.dispatcher, dispatchers_shutdown.clone());

    let registry = Arc::new(ConsumerRegistry::new());
    let flow_control = Arc::new(FlowControl::new(
        config.flow_control.clone(),
        &config.chunk_topic,
        registry.clone(),
    ));
    let signals = Arc::new(PipelineSignals::new(
        flow_control.clone(),
        ChunkTracker::new(config.chunk_dedup_capacity, config.chunk_dedup_ttl()),
        progress,
        journal,
    ));

    let producer = create_kafka_producer(&config.kafka)
        .await
        .expect("failed to create kafka producer");

    let mut workers = Vec::with_capacity(config.ingestion_consumers + 1);
    for index in 0..config.ingestion_consumers {
        let name = format!("{}-{}", config.chunk_topic, index);
        let consumer = Arc::new(TopicConsumer::new(
            &config.kafka,
            &config.chunk_topic,
            &name,
        )?);
        registry.register(&config.chunk_topic, consumer.clone());

        let worker = IngestionWorker::new(
            consumer,
            producer.clone(),
            &config.processing_topic,
            signals.clone(),
            RetryPolicy::from(&config.dispatcher),
        );
        workers.push(tokio::spawn(worker.run(consumers_shutdown.clone())));
    }

    let completion_consumer =
        TopicConsumer::new(&config.kafka, &config.completion_topic, "completions")?;
    let completion_worker = CompletionWorker::new(completion_consumer, signals.clone());
    workers.push(tokio::spawn(
        completion_worker.run(consumers_shutdown.clone()),
    ));

    let router = app(AppState {
        flow_control,
        shutdown: consumers_shutdown.clone(),
    });
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutting down");

    consumers_shutdown.cancel();
    for worker in workers {
        if let Err(error) = worker.await {
            error!("worker task failed: {}", error);
        }
    }

    dispatchers_shutdown.cancel();
    for drain_loop in [progress_loop, journal_loop] {
        if let Err(error) = drain_loop.await {
            error!("dispatcher task failed: {}", error);
        }
    }
    info!("shutdown complete");

    Ok(())
}
