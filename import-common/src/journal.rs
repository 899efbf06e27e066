use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::dispatcher::{BatchDispatcher, Mutation, Persister};
use crate::error::FlushError;
use crate::storage::JournalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Completed,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Completed => "completed",
            ActionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one source record while it was imported.
///
/// The id is derived from the job, the source record and the action, so a completion that is
/// delivered twice produces the same record and is written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: Uuid,
    pub job_execution_id: Uuid,
    pub source_record_id: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub action_type: String,
    pub action_status: ActionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JournalRecord {
    pub fn new(
        job_execution_id: Uuid,
        source_record_id: &str,
        entity_type: &str,
        action_type: &str,
        action_status: ActionStatus,
    ) -> Self {
        Self {
            id: journal_record_id(
                job_execution_id,
                source_record_id,
                entity_type,
                action_type,
                action_status,
            ),
            job_execution_id,
            source_record_id: source_record_id.to_owned(),
            entity_type: entity_type.to_owned(),
            entity_id: None,
            action_type: action_type.to_owned(),
            action_status,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

fn journal_record_id(
    job_execution_id: Uuid,
    source_record_id: &str,
    entity_type: &str,
    action_type: &str,
    action_status: ActionStatus,
) -> Uuid {
    let name = [
        source_record_id,
        entity_type,
        action_type,
        action_status.as_str(),
    ]
    .join("\u{0}");
    Uuid::new_v5(&job_execution_id, name.as_bytes())
}

/// Journal records of one job waiting to be written, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalBatch(pub Vec<JournalRecord>);

impl Mutation for JournalBatch {
    fn merge(&mut self, later: Self) {
        self.0.extend(later.0);
    }
}

pub struct JournalPersister<S> {
    store: Arc<S>,
}

impl<S> JournalPersister<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: JournalStore> Persister<Uuid, JournalBatch> for JournalPersister<S> {
    async fn persist(
        &self,
        _job_execution_id: &Uuid,
        batch: &JournalBatch,
    ) -> Result<(), FlushError> {
        self.store.save_journal_batch(&batch.0).await?;
        Ok(())
    }
}

/// Batches journal records per job and writes each batch in a single insert.
#[derive(Clone)]
pub struct JournalAccumulator {
    dispatcher: BatchDispatcher<Uuid, JournalBatch>,
}

impl JournalAccumulator {
    pub fn spawn<S: JournalStore>(
        store: Arc<S>,
        config: &DispatcherConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let persister = Arc::new(JournalPersister::new(store));
        let (dispatcher, handle) = BatchDispatcher::build("journal", persister)
            .config(config)
            .on_failure(|job_execution_id: &Uuid, error: &FlushError| {
                warn!(
                    job_execution_id = %job_execution_id,
                    "journal records for job will be lost: {}",
                    error
                );
            })
            .shutdown(shutdown)
            .spawn();

        (Self { dispatcher }, handle)
    }

    pub fn record(&self, record: JournalRecord) {
        self.dispatcher
            .submit(record.job_execution_id, JournalBatch(vec![record]));
    }

    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await
    }
}
