//! Outstanding-job cache shared by the job managers and the monitors.
//!
//! The manager inserts an entry in `cache_job`; monitors read the
//! entries of their backend and the status writer drops an entry once
//! its job reaches a terminal status. The cache is never the source of
//! truth: on startup it is rebuilt from the store's active jobs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use jobctl_core::backend::ComputeBackend;
use jobctl_core::status::JobStatus;
use jobctl_core::types::{JobId, Timestamp, WorkflowId};
use tokio::sync::RwLock;

use crate::store::{JobStore, StoreError};

/// What a monitor needs to observe one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedJob {
    pub job_id: JobId,
    pub backend: ComputeBackend,
    pub backend_job_id: String,
    pub workflow_id: WorkflowId,
    /// Working directory of the job, where batch exit-code files land.
    pub workspace: PathBuf,
    /// Last status written for this job.
    pub status: JobStatus,
    pub cached_at: Timestamp,
}

/// Cloneable handle to the shared cache.
#[derive(Debug, Clone, Default)]
pub struct JobCache {
    inner: Arc<RwLock<HashMap<JobId, CachedJob>>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub async fn insert(&self, job: CachedJob) {
        self.inner.write().await.insert(job.job_id, job);
    }

    pub async fn get(&self, job_id: JobId) -> Option<CachedJob> {
        self.inner.read().await.get(&job_id).cloned()
    }

    pub async fn remove(&self, job_id: JobId) -> Option<CachedJob> {
        self.inner.write().await.remove(&job_id)
    }

    /// Entries for one backend, oldest first.
    pub async fn outstanding(&self, backend: ComputeBackend) -> Vec<CachedJob> {
        let mut jobs: Vec<CachedJob> = self
            .inner
            .read()
            .await
            .values()
            .filter(|job| job.backend == backend)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.cached_at);
        jobs
    }

    /// Look an entry up by the backend-assigned id.
    pub async fn find_by_backend_id(
        &self,
        backend: ComputeBackend,
        backend_job_id: &str,
    ) -> Option<CachedJob> {
        self.inner
            .read()
            .await
            .values()
            .find(|job| job.backend == backend && job.backend_job_id == backend_job_id)
            .cloned()
    }

    /// Record the latest written status of an entry, if present.
    pub async fn set_status(&self, job_id: JobId, status: JobStatus) {
        if let Some(job) = self.inner.write().await.get_mut(&job_id) {
            job.status = status;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Rebuild the entries of one backend from the store's active jobs.
    ///
    /// Existing entries for the backend are replaced so that jobs which
    /// became terminal while the process was down do not linger. Returns
    /// the number of entries loaded.
    pub async fn resync_from_store(
        &self,
        store: &dyn JobStore,
        backend: ComputeBackend,
        shared_volume_root: &std::path::Path,
    ) -> Result<usize, StoreError> {
        let active = store.list_active(backend).await?;
        let mut inner = self.inner.write().await;
        inner.retain(|_, job| job.backend != backend);

        let mut loaded = 0;
        for job in active {
            // Created records never reached a backend and cannot be observed.
            let Some(backend_job_id) = job.backend_job_id.clone() else {
                continue;
            };
            inner.insert(
                job.id,
                CachedJob {
                    job_id: job.id,
                    backend,
                    backend_job_id,
                    workflow_id: job.workflow_id,
                    workspace: job.resolve_workspace(shared_volume_root),
                    status: job.status,
                    cached_at: job.created_at,
                },
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}
