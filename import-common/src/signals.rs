//! The two signals the worker raises for every chunk and every record, and what they fan out to.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::chunks::{Admission, ChunkTracker};
use crate::flow_control::FlowControl;
use crate::journal::{ActionStatus, JournalAccumulator, JournalRecord};
use crate::metrics_consts::{CHUNKS_ADMITTED, CHUNKS_DUPLICATED};
use crate::progress::ProgressAccumulator;
use crate::storage::ProgressStore;

/// A slice of an import job, as published on the chunk topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvent {
    pub job_execution_id: Uuid,
    pub chunk_id: String,
    pub record_count: u64,
    /// Set on the chunk that knows how many records the whole job holds.
    #[serde(default)]
    pub total_records: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The outcome of processing one record, as published on the completion topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordProcessed {
    pub job_execution_id: Uuid,
    pub source_record_id: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub action_type: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&RecordProcessed> for JournalRecord {
    fn from(event: &RecordProcessed) -> Self {
        JournalRecord::new(
            event.job_execution_id,
            &event.source_record_id,
            &event.entity_type,
            &event.action_type,
            event.status,
        )
        .with_entity_id(event.entity_id.clone())
        .with_error(event.error.clone())
    }
}

pub struct PipelineSignals<S> {
    flow_control: Arc<FlowControl>,
    chunks: ChunkTracker,
    progress: ProgressAccumulator<S>,
    journal: JournalAccumulator,
}

impl<S: ProgressStore> PipelineSignals<S> {
    pub fn new(
        flow_control: Arc<FlowControl>,
        chunks: ChunkTracker,
        progress: ProgressAccumulator<S>,
        journal: JournalAccumulator,
    ) -> Self {
        Self {
            flow_control,
            chunks,
            progress,
            journal,
        }
    }

    /// A chunk arrived on the ingestion topic. Only `Fresh` chunks should be forwarded.
    ///
    /// Every delivery is counted on arrival, a redelivered chunk is then taken back out of the
    /// count right away, so a redelivery leaves the in-flight count where it was.
    pub fn chunk_received(&self, chunk: &ChunkEvent) -> Admission {
        self.flow_control.on_chunk_admitted(chunk.record_count);

        let admission = self
            .chunks
            .observe(chunk.job_execution_id, &chunk.chunk_id);
        match admission {
            Admission::Fresh => {
                metrics::counter!(CHUNKS_ADMITTED).increment(1);
                // The first chunk of a job may arrive before anything else created its row.
                self.progress
                    .create_job(chunk.job_execution_id, chunk.total_records);
            }
            Admission::Duplicate => {
                debug!(
                    job_execution_id = %chunk.job_execution_id,
                    chunk_id = %chunk.chunk_id,
                    record_count = chunk.record_count,
                    "chunk was already admitted"
                );
                metrics::counter!(CHUNKS_DUPLICATED).increment(1);
                self.flow_control
                    .on_chunk_duplicate_detected(chunk.record_count);
            }
        }
        admission
    }

    /// A record left the pipeline, successfully or not.
    pub fn record_processed(&self, event: &RecordProcessed) {
        self.flow_control.on_record_completed();
        self.progress.record_completion(
            event.job_execution_id,
            event.status == ActionStatus::Completed,
        );
        self.journal.record(JournalRecord::from(event));
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn progress(&self) -> &ProgressAccumulator<S> {
        &self.progress
    }

    pub fn journal(&self) -> &JournalAccumulator {
        &self.journal
    }
}
