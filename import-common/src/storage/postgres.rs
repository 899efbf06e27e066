use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::StoreError;
use crate::journal::JournalRecord;
use crate::progress::{JobProgress, ProgressDelta, ProgressMutation};
use crate::storage::{JournalStore, ProgressStore};

/// Progress and journal tables on top of PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore with a connection pool of at most `max_connections`.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "CONNECT".to_owned(),
                error,
            })?;

        Ok(Self { pool })
    }

    /// Apply the migrations found under `path`.
    pub async fn migrate(&self, path: &Path) -> Result<(), StoreError> {
        let migrator = sqlx::migrate::Migrator::new(path)
            .await
            .map_err(|error| StoreError::Permanent(error.to_string()))?;
        migrator
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Permanent(error.to_string()))
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn create_progress(
        &self,
        job_execution_id: Uuid,
        total: Option<i64>,
    ) -> Result<JobProgress, StoreError> {
        let query = r#"
INSERT INTO import_job_progress
    (job_execution_id, total, succeeded, failed, created_at, updated_at)
VALUES
    ($1, $2, 0, 0, NOW(), NOW())
ON CONFLICT (job_execution_id) DO UPDATE SET
    total = COALESCE(EXCLUDED.total, import_job_progress.total),
    updated_at = NOW()
RETURNING
    job_execution_id, total, succeeded, failed
        "#;

        sqlx::query_as(query)
            .bind(job_execution_id)
            .bind(total)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    async fn load_progress(&self, job_execution_id: Uuid) -> Result<JobProgress, StoreError> {
        let query = r#"
SELECT
    job_execution_id, total, succeeded, failed
FROM
    import_job_progress
WHERE
    job_execution_id = $1
        "#;

        let progress: Option<JobProgress> = sqlx::query_as(query)
            .bind(job_execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        progress.ok_or(StoreError::NotFound(job_execution_id))
    }

    async fn apply_delta(&self, delta: &ProgressDelta) -> Result<JobProgress, StoreError> {
        let query = r#"
UPDATE
    import_job_progress
SET
    succeeded = import_job_progress.succeeded + $2,
    failed = import_job_progress.failed + $3,
    updated_at = NOW()
WHERE
    job_execution_id = $1
RETURNING
    job_execution_id, total, succeeded, failed
        "#;

        let progress: Option<JobProgress> = sqlx::query_as(query)
            .bind(delta.job_execution_id)
            .bind(delta.success_count_delta)
            .bind(delta.error_count_delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        progress.ok_or(StoreError::NotFound(delta.job_execution_id))
    }

    async fn update_progress(
        &self,
        job_execution_id: Uuid,
        mutation: &ProgressMutation,
    ) -> Result<JobProgress, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        if mutation.creates_job() {
            // A concurrent insert of the same row waits for this one to commit, so both
            // end up reading it under the lock below.
            let query = r#"
INSERT INTO import_job_progress
    (job_execution_id, total, succeeded, failed, created_at, updated_at)
VALUES
    ($1, NULL, 0, 0, NOW(), NOW())
ON CONFLICT (job_execution_id) DO NOTHING
            "#;

            sqlx::query(query)
                .bind(job_execution_id)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                })?;
        }

        let query = r#"
SELECT
    job_execution_id, total, succeeded, failed
FROM
    import_job_progress
WHERE
    job_execution_id = $1
FOR UPDATE
        "#;

        let current: Option<JobProgress> = sqlx::query_as(query)
            .bind(job_execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        let current = current.ok_or(StoreError::NotFound(job_execution_id))?;
        let updated = mutation.apply(current);

        let query = r#"
UPDATE
    import_job_progress
SET
    total = $2,
    succeeded = $3,
    failed = $4,
    updated_at = NOW()
WHERE
    job_execution_id = $1
RETURNING
    job_execution_id, total, succeeded, failed
        "#;

        let saved: JobProgress = sqlx::query_as(query)
            .bind(job_execution_id)
            .bind(updated.total)
            .bind(updated.succeeded)
            .bind(updated.failed)
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(saved)
    }
}

#[async_trait]
impl JournalStore for PgStore {
    async fn save_journal_batch(&self, records: &[JournalRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(records.len());
        let mut job_execution_ids = Vec::with_capacity(records.len());
        let mut source_record_ids = Vec::with_capacity(records.len());
        let mut entity_types = Vec::with_capacity(records.len());
        let mut entity_ids: Vec<Option<String>> = Vec::with_capacity(records.len());
        let mut action_types = Vec::with_capacity(records.len());
        let mut action_statuses = Vec::with_capacity(records.len());
        let mut errors: Vec<Option<String>> = Vec::with_capacity(records.len());
        let mut created_ats: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());

        for record in records {
            ids.push(record.id);
            job_execution_ids.push(record.job_execution_id);
            source_record_ids.push(record.source_record_id.clone());
            entity_types.push(record.entity_type.clone());
            entity_ids.push(record.entity_id.clone());
            action_types.push(record.action_type.clone());
            action_statuses.push(record.action_status.as_str().to_owned());
            errors.push(record.error.clone());
            created_ats.push(record.created_at);
        }

        let query = r#"
INSERT INTO import_journal_records
    (id, job_execution_id, source_record_id, entity_type, entity_id, action_type, action_status, error, created_at)
SELECT * FROM UNNEST(
    $1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[], $9::timestamptz[]
)
ON CONFLICT (id) DO NOTHING
        "#;

        sqlx::query(query)
            .bind(&ids)
            .bind(&job_execution_ids)
            .bind(&source_record_ids)
            .bind(&entity_types)
            .bind(&entity_ids)
            .bind(&action_types)
            .bind(&action_statuses)
            .bind(&errors)
            .bind(&created_ats)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }
}
