use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::journal::JournalRecord;
use crate::progress::{JobProgress, ProgressDelta, ProgressMutation};
use crate::storage::{JournalStore, ProgressStore};

#[derive(Default)]
struct Tables {
    progress: HashMap<Uuid, JobProgress>,
    journal: Vec<JournalRecord>,
}

/// A store kept entirely in process memory, for tests and local runs without Postgres.
///
/// Counts its writes so callers can check how much batching happened, and can be switched
/// into an unavailable state where every call fails with a transient error.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    delta_writes: AtomicUsize,
    full_writes: AtomicUsize,
    journal_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn delta_writes(&self) -> usize {
        self.delta_writes.load(Ordering::SeqCst)
    }

    pub fn full_writes(&self) -> usize {
        self.full_writes.load(Ordering::SeqCst)
    }

    pub fn journal_writes(&self) -> usize {
        self.journal_writes.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<JournalRecord> {
        self.tables().journal.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("memory store is unavailable".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn create_progress(
        &self,
        job_execution_id: Uuid,
        total: Option<i64>,
    ) -> Result<JobProgress, StoreError> {
        self.check_available()?;
        let mut tables = self.tables();
        let progress = tables
            .progress
            .entry(job_execution_id)
            .or_insert_with(|| JobProgress::new(job_execution_id, total));
        if total.is_some() {
            progress.total = total;
        }
        Ok(progress.clone())
    }

    async fn load_progress(&self, job_execution_id: Uuid) -> Result<JobProgress, StoreError> {
        self.check_available()?;
        self.tables()
            .progress
            .get(&job_execution_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_execution_id))
    }

    async fn apply_delta(&self, delta: &ProgressDelta) -> Result<JobProgress, StoreError> {
        self.check_available()?;
        self.delta_writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables();
        let progress = tables
            .progress
            .get_mut(&delta.job_execution_id)
            .ok_or(StoreError::NotFound(delta.job_execution_id))?;
        progress.succeeded += delta.success_count_delta;
        progress.failed += delta.error_count_delta;
        Ok(progress.clone())
    }

    async fn update_progress(
        &self,
        job_execution_id: Uuid,
        mutation: &ProgressMutation,
    ) -> Result<JobProgress, StoreError> {
        self.check_available()?;
        self.full_writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables();
        let current = match tables.progress.get(&job_execution_id) {
            Some(current) => current.clone(),
            None if mutation.creates_job() => JobProgress::new(job_execution_id, None),
            None => return Err(StoreError::NotFound(job_execution_id)),
        };
        let updated = mutation.apply(current);
        tables.progress.insert(job_execution_id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl JournalStore for MemoryStore {
    async fn save_journal_batch(&self, records: &[JournalRecord]) -> Result<(), StoreError> {
        self.check_available()?;
        self.journal_writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables();
        if let Some(record) = records
            .iter()
            .find(|record| !tables.progress.contains_key(&record.job_execution_id))
        {
            return Err(StoreError::Permanent(format!(
                "journal record {} references unknown job execution {}",
                record.id, record.job_execution_id
            )));
        }
        // Same as the unique key on the journal table: a record already written is skipped.
        for record in records {
            if !tables.journal.iter().any(|stored| stored.id == record.id) {
                tables.journal.push(record.clone());
            }
        }
        Ok(())
    }
}
