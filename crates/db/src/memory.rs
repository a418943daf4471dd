//! Process-local [`JobStore`].
//!
//! Used by tests across the workspace and by single-node deployments
//! that do not need durable records. Enforces the same uniqueness and
//! conditional-update rules as the Postgres repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use jobctl_core::backend::ComputeBackend;
use jobctl_core::job::Job;
use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;
use tokio::sync::RwLock;

use crate::store::{JobStore, StoreError, UpdateOutcome};

/// In-memory job records.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    /// (or succeed again with `false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<JobId, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        if let Some(backend_job_id) = &job.backend_job_id {
            let clash = jobs.values().any(|existing| {
                existing.backend == job.backend
                    && existing.backend_job_id.as_ref() == Some(backend_job_id)
            });
            if clash {
                return Err(StoreError::Duplicate(format!(
                    "{} job id {backend_job_id}",
                    job.backend
                )));
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        expected_previous: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == expected_previous => {
                job.status = status;
                job.updated_at = chrono::Utc::now();
                Ok(UpdateOutcome::Updated)
            }
            _ => Ok(UpdateOutcome::Conflict),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_active(&self, backend: ComputeBackend) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        let mut active: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.backend == backend && !job.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|job| job.created_at);
        Ok(active)
    }

    async fn store_logs(&self, id: JobId, logs: &str) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.logs = Some(logs.to_string());
            job.updated_at = chrono::Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use jobctl_core::job::JobRequest;

    use super::*;

    fn job(backend: ComputeBackend, backend_job_id: &str) -> Job {
        let request = JobRequest::new("busybox", vec!["ls".into()], uuid::Uuid::new_v4())
            .with_backend(backend);
        Job::submitted(uuid::Uuid::new_v4(), &request, backend_job_id, chrono::Utc::now())
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = InMemoryJobStore::new();
        let job = job(ComputeBackend::Kubernetes, "jobctl-run-1");
        let id = store.create(&job).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn backend_job_id_is_unique_per_backend() {
        let store = InMemoryJobStore::new();
        store.create(&job(ComputeBackend::Slurm, "42")).await.unwrap();
        assert_matches!(
            store.create(&job(ComputeBackend::Slurm, "42")).await,
            Err(StoreError::Duplicate(_))
        );
        // Same id on another backend's namespace is fine.
        store.create(&job(ComputeBackend::HtCondor, "42")).await.unwrap();
    }

    #[tokio::test]
    async fn update_is_conditional_on_previous_status() {
        let store = InMemoryJobStore::new();
        let job = job(ComputeBackend::Slurm, "7");
        store.create(&job).await.unwrap();

        let outcome = store
            .update_status(job.id, JobStatus::Running, JobStatus::Created)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Conflict);

        let outcome = store
            .update_status(job.id, JobStatus::Running, JobStatus::Submitted)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn list_active_skips_terminal_and_other_backends() {
        let store = InMemoryJobStore::new();
        let a = job(ComputeBackend::Slurm, "1");
        let b = job(ComputeBackend::Slurm, "2");
        let c = job(ComputeBackend::HtCondor, "3");
        for j in [&a, &b, &c] {
            store.create(j).await.unwrap();
        }
        store
            .update_status(b.id, JobStatus::Failed, JobStatus::Submitted)
            .await
            .unwrap();

        let active = store.list_active(ComputeBackend::Slurm).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryJobStore::new();
        store.set_unavailable(true);
        assert_matches!(
            store.get(uuid::Uuid::new_v4()).await,
            Err(StoreError::Unavailable)
        );
        store.set_unavailable(false);
        assert!(store.get(uuid::Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_logs_attaches_text() {
        let store = InMemoryJobStore::new();
        let job = job(ComputeBackend::Kubernetes, "jobctl-run-2");
        store.create(&job).await.unwrap();
        store.store_logs(job.id, "job: \n hello \n").await.unwrap();
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.logs.as_deref(), Some("job: \n hello \n"));
    }
}
