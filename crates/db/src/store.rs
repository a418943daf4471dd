//! The Job Record Store interface.

use async_trait::async_trait;
use jobctl_core::backend::ComputeBackend;
use jobctl_core::job::Job;
use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;

/// Result of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The stored status matched the expected previous one and was replaced.
    Updated,
    /// The stored status differed (or the job vanished); nothing was written.
    Conflict,
}

/// Errors from a store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row could not be mapped back to a [`Job`].
    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: JobId, reason: String },

    /// A job with the same id, or the same backend job id on the same
    /// backend, already exists.
    #[error("Duplicate job: {0}")]
    Duplicate(String),

    /// The store cannot be reached at all.
    #[error("Job store unavailable")]
    Unavailable,
}

impl StoreError {
    /// Whether the store itself is gone, as opposed to one query failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Durable job records. The dispatch subsystem creates records and
/// mutates `status`, `backend_job_id`, `updated_at`, and `logs` only.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record and return its id.
    async fn create(&self, job: &Job) -> Result<JobId, StoreError>;

    /// Set `status` only if the stored status equals `expected_previous`.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        expected_previous: JobStatus,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Fetch one record.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// All non-terminal records for a backend, oldest first.
    async fn list_active(&self, backend: ComputeBackend) -> Result<Vec<Job>, StoreError>;

    /// Attach collected logs to a record.
    async fn store_logs(&self, id: JobId, logs: &str) -> Result<(), StoreError>;
}
