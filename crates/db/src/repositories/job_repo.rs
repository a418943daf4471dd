//! Repository for the `jobs` table.
//!
//! Statuses and backends are stored as their wire-format strings. Every
//! status write is conditional on the previous status so that a stale
//! monitor cannot overwrite a newer terminal state.

use std::path::PathBuf;

use async_trait::async_trait;
use jobctl_core::backend::ComputeBackend;
use jobctl_core::job::Job;
use jobctl_core::status::JobStatus;
use jobctl_core::types::{JobId, Timestamp};
use sqlx::{FromRow, PgPool};

use crate::store::{JobStore, StoreError, UpdateOutcome};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, backend, backend_job_id, status, workflow_id, workspace, logs, \
    created_at, updated_at";

/// Terminal statuses as stored.
const TERMINAL_STATUSES: [&str; 3] = ["succeeded", "failed", "stopped"];

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: JobId,
    backend: String,
    backend_job_id: Option<String>,
    status: String,
    workflow_id: uuid::Uuid,
    workspace: Option<String>,
    logs: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };
        let status = JobStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?;
        let backend =
            ComputeBackend::from_str(&row.backend).map_err(|e| corrupt(e.to_string()))?;
        Ok(Job {
            id: row.id,
            backend_job_id: row.backend_job_id,
            status,
            workflow_id: row.workflow_id,
            backend,
            created_at: row.created_at,
            updated_at: row.updated_at,
            workspace: row.workspace.map(PathBuf::from),
            logs: row.logs,
        })
    }
}

/// Provides CRUD operations for job records.
pub struct JobRepo;

impl JobRepo {
    /// Insert a job record.
    pub async fn create(pool: &PgPool, job: &Job) -> Result<JobId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, backend, backend_job_id, status, workflow_id, workspace, \
                               logs, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(job.id)
        .bind(job.backend.as_str())
        .bind(job.backend_job_id.as_deref())
        .bind(job.status.as_str())
        .bind(job.workflow_id)
        .bind(job.workspace.as_deref().map(|p| p.to_string_lossy().into_owned()))
        .bind(job.logs.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(StoreError::Duplicate(format!(
                    "job {} / {} {}",
                    job.id,
                    job.backend,
                    job.backend_job_id.as_deref().unwrap_or("-")
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conditionally move a job from `expected_previous` to `status`.
    pub async fn update_status(
        pool: &PgPool,
        id: JobId,
        status: JobStatus,
        expected_previous: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = $3",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(expected_previous.as_str())
        .execute(pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            UpdateOutcome::Updated
        } else {
            UpdateOutcome::Conflict
        })
    }

    /// Find a job by its id.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    /// Non-terminal jobs of a backend, oldest first.
    pub async fn list_active(
        pool: &PgPool,
        backend: ComputeBackend,
    ) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE backend = $1 AND status NOT IN ($2, $3, $4) \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(backend.as_str())
            .bind(TERMINAL_STATUSES[0])
            .bind(TERMINAL_STATUSES[1])
            .bind(TERMINAL_STATUSES[2])
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    /// Store collected logs.
    pub async fn store_logs(pool: &PgPool, id: JobId, logs: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET logs = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(logs)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// [`JobStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Connection-level failures mean the store is unreachable, not that a
/// query was wrong.
fn classify(err: StoreError) -> StoreError {
    match err {
        StoreError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
            StoreError::Unavailable
        }
        other => other,
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<JobId, StoreError> {
        JobRepo::create(&self.pool, job).await.map_err(classify)
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        expected_previous: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        JobRepo::update_status(&self.pool, id, status, expected_previous)
            .await
            .map_err(classify)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        JobRepo::find_by_id(&self.pool, id).await.map_err(classify)
    }

    async fn list_active(&self, backend: ComputeBackend) -> Result<Vec<Job>, StoreError> {
        JobRepo::list_active(&self.pool, backend)
            .await
            .map_err(classify)
    }

    async fn store_logs(&self, id: JobId, logs: &str) -> Result<(), StoreError> {
        JobRepo::store_logs(&self.pool, id, logs)
            .await
            .map_err(classify)
    }
}
