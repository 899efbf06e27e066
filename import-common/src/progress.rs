//! Per-job progress counters, batched through a `BatchDispatcher`.
//!
//! Completion signals arrive once per record and at-least-once, from many consumers. They are
//! turned into arithmetic deltas that commute, so arrival order never matters, while the rarer
//! administrative updates (setting the total once it is known) are carried as mutators that
//! keep their place relative to the deltas around them.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::dispatcher::{BatchDispatcher, Mutation, Persister};
use crate::error::{FlushError, StoreError};
use crate::metrics_consts::PROGRESS_OVERFLOW;
use crate::storage::ProgressStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobProgress {
    pub job_execution_id: Uuid,
    /// Unknown until the first chunk of the job reports how many records it holds.
    pub total: Option<i64>,
    pub succeeded: i64,
    pub failed: i64,
}

impl JobProgress {
    pub fn new(job_execution_id: Uuid, total: Option<i64>) -> Self {
        Self {
            job_execution_id,
            total,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn processed(&self) -> i64 {
        self.succeeded + self.failed
    }

    /// More records were reported processed than the job holds. Points at duplicate
    /// completion signals or a wrong total.
    pub fn exceeds_total(&self) -> bool {
        matches!(self.total, Some(total) if self.processed() > total)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.processed() >= total)
    }

    pub fn apply(mut self, delta: &ProgressDelta) -> Self {
        self.succeeded += delta.success_count_delta;
        self.failed += delta.error_count_delta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub job_execution_id: Uuid,
    pub success_count_delta: i64,
    pub error_count_delta: i64,
}

impl ProgressDelta {
    pub fn new(job_execution_id: Uuid) -> Self {
        Self {
            job_execution_id,
            success_count_delta: 0,
            error_count_delta: 0,
        }
    }

    pub fn succeeded(job_execution_id: Uuid) -> Self {
        Self {
            success_count_delta: 1,
            ..Self::new(job_execution_id)
        }
    }

    pub fn failed(job_execution_id: Uuid) -> Self {
        Self {
            error_count_delta: 1,
            ..Self::new(job_execution_id)
        }
    }

    pub fn add(&mut self, other: &ProgressDelta) {
        self.success_count_delta += other.success_count_delta;
        self.error_count_delta += other.error_count_delta;
    }
}

/// An arbitrary update of a job's progress, applied after every delta submitted before it.
#[derive(Clone)]
pub struct ProgressMutator(Arc<dyn Fn(JobProgress) -> JobProgress + Send + Sync>);

impl ProgressMutator {
    pub fn new<F>(mutator: F) -> Self
    where
        F: Fn(JobProgress) -> JobProgress + Send + Sync + 'static,
    {
        Self(Arc::new(mutator))
    }

    pub fn apply(&self, progress: JobProgress) -> JobProgress {
        (self.0)(progress)
    }
}

impl fmt::Debug for ProgressMutator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressMutator")
    }
}

#[derive(Debug, Clone)]
pub enum ProgressStep {
    Delta(ProgressDelta),
    Mutate(ProgressMutator),
    /// Create the job's row if it does not exist yet, and set its total when known.
    Create { total: Option<i64> },
}

/// Everything submitted for one job since its last flush, in program order.
///
/// Consecutive deltas collapse into one, so a stream made only of completions stays a single
/// delta no matter how many records it covers.
#[derive(Debug, Clone)]
pub struct ProgressMutation {
    steps: Vec<ProgressStep>,
}

impl ProgressMutation {
    pub fn delta(delta: ProgressDelta) -> Self {
        Self {
            steps: vec![ProgressStep::Delta(delta)],
        }
    }

    pub fn mutator(mutator: ProgressMutator) -> Self {
        Self {
            steps: vec![ProgressStep::Mutate(mutator)],
        }
    }

    pub fn create(total: Option<i64>) -> Self {
        Self {
            steps: vec![ProgressStep::Create { total }],
        }
    }

    pub fn steps(&self) -> &[ProgressStep] {
        &self.steps
    }

    /// Whether persisting this mutation may create the job's row.
    pub fn creates_job(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, ProgressStep::Create { .. }))
    }

    /// The single delta this mutation amounts to, if it holds no mutator.
    pub fn as_delta(&self) -> Option<&ProgressDelta> {
        match self.steps.as_slice() {
            [ProgressStep::Delta(delta)] => Some(delta),
            _ => None,
        }
    }

    pub fn apply(&self, progress: JobProgress) -> JobProgress {
        self.steps
            .iter()
            .fold(progress, |progress, step| match step {
                ProgressStep::Delta(delta) => progress.apply(delta),
                ProgressStep::Mutate(mutator) => mutator.apply(progress),
                ProgressStep::Create { total: None } => progress,
                ProgressStep::Create { total } => JobProgress {
                    total: *total,
                    ..progress
                },
            })
    }
}

impl Mutation for ProgressMutation {
    fn merge(&mut self, later: Self) {
        for step in later.steps {
            match (self.steps.last_mut(), step) {
                (Some(ProgressStep::Delta(current)), ProgressStep::Delta(next)) => {
                    current.add(&next)
                }
                (_, step) => self.steps.push(step),
            }
        }
    }
}

/// Writes merged progress mutations to the store.
///
/// Pure deltas go through the store's atomic increment. Anything else needs the current row,
/// so the store applies it under a row lock, which keeps increments made by other processes
/// in the meantime.
pub struct ProgressPersister<S> {
    store: Arc<S>,
}

impl<S> ProgressPersister<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ProgressStore> Persister<Uuid, ProgressMutation> for ProgressPersister<S> {
    async fn persist(
        &self,
        job_execution_id: &Uuid,
        mutation: &ProgressMutation,
    ) -> Result<(), FlushError> {
        let progress = match mutation.as_delta() {
            Some(delta) => self.store.apply_delta(delta).await?,
            None => self.store.update_progress(*job_execution_id, mutation).await?,
        };

        if progress.exceeds_total() {
            warn!(
                job_execution_id = %progress.job_execution_id,
                total = progress.total,
                succeeded = progress.succeeded,
                failed = progress.failed,
                "job reports more processed records than its total"
            );
            metrics::counter!(PROGRESS_OVERFLOW).increment(1);
        }
        Ok(())
    }
}

/// The job-progress client of the dispatcher.
pub struct ProgressAccumulator<S> {
    dispatcher: BatchDispatcher<Uuid, ProgressMutation>,
    store: Arc<S>,
}

impl<S> Clone for ProgressAccumulator<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: ProgressStore> ProgressAccumulator<S> {
    /// Start a drain loop writing to `store`, stopped by `shutdown`.
    pub fn spawn(
        store: Arc<S>,
        config: &DispatcherConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let persister = Arc::new(ProgressPersister::new(store.clone()));
        let (dispatcher, handle) = BatchDispatcher::build("progress", persister)
            .config(config)
            .on_failure(|job_execution_id: &Uuid, error: &FlushError| {
                warn!(
                    job_execution_id = %job_execution_id,
                    "progress updates for job will be lost: {}",
                    error
                );
            })
            .shutdown(shutdown)
            .spawn();

        (Self { dispatcher, store }, handle)
    }

    pub fn from_dispatcher(
        dispatcher: BatchDispatcher<Uuid, ProgressMutation>,
        store: Arc<S>,
    ) -> Self {
        Self { dispatcher, store }
    }

    pub fn record_completion(&self, job_execution_id: Uuid, succeeded: bool) {
        let delta = if succeeded {
            ProgressDelta::succeeded(job_execution_id)
        } else {
            ProgressDelta::failed(job_execution_id)
        };
        self.dispatcher
            .submit(job_execution_id, ProgressMutation::delta(delta));
    }

    pub fn apply_mutator<F>(&self, job_execution_id: Uuid, mutator: F)
    where
        F: Fn(JobProgress) -> JobProgress + Send + Sync + 'static,
    {
        self.dispatcher.submit(
            job_execution_id,
            ProgressMutation::mutator(ProgressMutator::new(mutator)),
        );
    }

    /// Make sure the job has a progress row, the first time one of its chunks is seen.
    pub fn create_job(&self, job_execution_id: Uuid, total: Option<i64>) {
        self.dispatcher
            .submit(job_execution_id, ProgressMutation::create(total));
    }

    pub fn initialize_total(&self, job_execution_id: Uuid, total: i64) {
        self.apply_mutator(job_execution_id, move |progress| JobProgress {
            total: Some(total),
            ..progress
        });
    }

    /// Reads from storage, so updates still waiting for a flush are not visible yet.
    pub async fn get_progress(&self, job_execution_id: Uuid) -> Result<JobProgress, StoreError> {
        self.store.load_progress(job_execution_id).await
    }

    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await
    }
}
