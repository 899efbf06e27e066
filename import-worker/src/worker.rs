use std::sync::Arc;
use std::time;

use import_common::chunks::Admission;
use import_common::kafka::{send_payload, Offset, RecvError, TopicConsumer};
use import_common::metrics_consts::{EVENTS_RECEIVED, EVENT_PARSE_ERROR};
use import_common::retry::RetryPolicy;
use import_common::signals::{ChunkEvent, PipelineSignals, RecordProcessed};
use import_common::storage::ProgressStore;
use rdkafka::producer::FutureProducer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause before polling again after the broker returned an error.
const RECV_ERROR_BACKOFF: time::Duration = time::Duration::from_millis(500);

/// Consumes chunks from the ingestion topic and forwards fresh ones to the processing topic.
pub struct IngestionWorker<S> {
    consumer: Arc<TopicConsumer>,
    producer: FutureProducer,
    processing_topic: String,
    signals: Arc<PipelineSignals<S>>,
    retry_policy: RetryPolicy,
}

impl<S: ProgressStore> IngestionWorker<S> {
    pub fn new(
        consumer: Arc<TopicConsumer>,
        producer: FutureProducer,
        processing_topic: &str,
        signals: Arc<PipelineSignals<S>>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            consumer,
            producer,
            processing_topic: processing_topic.to_owned(),
            signals,
            retry_policy,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(topic = self.consumer.topic(), "starting ingestion worker");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.json_recv::<ChunkEvent>() => received,
            };

            match received {
                Ok((chunk, offset)) => {
                    if !self.handle_chunk(chunk, offset, &shutdown).await {
                        break;
                    }
                }
                Err(error) => handle_recv_error(self.consumer.topic(), error).await,
            }
        }

        info!(topic = self.consumer.topic(), "ingestion worker stopped");
    }

    /// Returns false when shutdown interrupted forwarding the chunk.
    async fn handle_chunk(
        &self,
        chunk: ChunkEvent,
        offset: Offset,
        shutdown: &CancellationToken,
    ) -> bool {
        metrics::counter!(EVENTS_RECEIVED, &[("topic", self.consumer.topic().to_owned())])
            .increment(1);

        if self.signals.chunk_received(&chunk) == Admission::Fresh
            && !self.forward(&chunk, shutdown).await
        {
            // Left unstored, so the chunk is delivered again after a restart.
            return false;
        }

        if let Err(error) = offset.store() {
            error!(
                job_execution_id = %chunk.job_execution_id,
                chunk_id = %chunk.chunk_id,
                "failed to store offset: {}",
                error
            );
        }
        true
    }

    /// Produce the chunk payload to the processing topic, retrying until it is acknowledged
    /// or shutdown is requested.
    async fn forward(&self, chunk: &ChunkEvent, shutdown: &CancellationToken) -> bool {
        let payload = match serde_json::to_vec(&chunk.payload) {
            Ok(payload) => payload,
            Err(error) => {
                error!(
                    job_execution_id = %chunk.job_execution_id,
                    chunk_id = %chunk.chunk_id,
                    "failed to serialize chunk payload: {}",
                    error
                );
                return true;
            }
        };
        let key = chunk.job_execution_id.to_string();

        let mut attempt: u32 = 0;
        loop {
            let error =
                match send_payload(&self.producer, &self.processing_topic, &key, &payload).await {
                    Ok(()) => return true,
                    Err(error) => error,
                };

            attempt += 1;
            let backoff = self.retry_policy.time_until_next_retry(attempt);
            warn!(
                job_execution_id = %chunk.job_execution_id,
                chunk_id = %chunk.chunk_id,
                attempt,
                "failed to forward chunk, retrying in {:?}: {}",
                backoff,
                error
            );

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Consumes record outcomes from the completion topic.
pub struct CompletionWorker<S> {
    consumer: TopicConsumer,
    signals: Arc<PipelineSignals<S>>,
}

impl<S: ProgressStore> CompletionWorker<S> {
    pub fn new(consumer: TopicConsumer, signals: Arc<PipelineSignals<S>>) -> Self {
        Self { consumer, signals }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(topic = self.consumer.topic(), "starting completion worker");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.consumer.json_recv::<RecordProcessed>() => received,
            };

            match received {
                Ok((event, offset)) => {
                    metrics::counter!(
                        EVENTS_RECEIVED,
                        &[("topic", self.consumer.topic().to_owned())]
                    )
                    .increment(1);

                    self.signals.record_processed(&event);

                    if let Err(error) = offset.store() {
                        error!(
                            job_execution_id = %event.job_execution_id,
                            source_record_id = %event.source_record_id,
                            "failed to store offset: {}",
                            error
                        );
                    }
                }
                Err(error) => handle_recv_error(self.consumer.topic(), error).await,
            }
        }

        info!(topic = self.consumer.topic(), "completion worker stopped");
    }
}

async fn handle_recv_error(topic: &str, error: RecvError) {
    match error {
        RecvError::Serde(_) | RecvError::Empty => {
            warn!(topic, "skipping undecodable message: {}", error);
            metrics::counter!(EVENT_PARSE_ERROR, &[("topic", topic.to_owned())]).increment(1);
        }
        RecvError::Kafka(_) | RecvError::Offset(_) => {
            error!(topic, "failed to receive message: {}", error);
            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
        }
    }
}
