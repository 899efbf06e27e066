//! The persistence collaborator behind the progress and journal accumulators.
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::journal::JournalRecord;
use crate::progress::{JobProgress, ProgressDelta, ProgressMutation};

pub mod memory;
pub mod postgres;

#[async_trait]
pub trait ProgressStore: Send + Sync + 'static {
    /// Create the progress row of a job, or set its total if the row already exists and
    /// `total` is known.
    async fn create_progress(
        &self,
        job_execution_id: Uuid,
        total: Option<i64>,
    ) -> Result<JobProgress, StoreError>;

    /// Fails with `StoreError::NotFound` for jobs that were never created.
    async fn load_progress(&self, job_execution_id: Uuid) -> Result<JobProgress, StoreError>;

    /// Atomically add both counters of `delta` to the stored row.
    async fn apply_delta(&self, delta: &ProgressDelta) -> Result<JobProgress, StoreError>;

    /// Apply every step of `mutation` to the stored row as one read-modify-write, so no
    /// concurrent `apply_delta` on the same row is lost. A missing row is created first when
    /// the mutation creates the job, otherwise this fails with `StoreError::NotFound`.
    async fn update_progress(
        &self,
        job_execution_id: Uuid,
        mutation: &ProgressMutation,
    ) -> Result<JobProgress, StoreError>;
}

#[async_trait]
pub trait JournalStore: Send + Sync + 'static {
    /// Insert all `records` in one write. Either all of them are stored or none is.
    async fn save_journal_batch(&self, records: &[JournalRecord]) -> Result<(), StoreError>;
}
