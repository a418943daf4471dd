//! Per-backend job manager.
//!
//! [`JobManager`] supplies the backend-agnostic hooks around a
//! [`JobBackend`]'s submission and owns cancellation. One manager exists
//! per enabled backend; they share the store and the outstanding-job
//! cache.

use std::sync::Arc;

use async_trait::async_trait;
use jobctl_core::backend::{ComputeBackend, JobBackend, StopOutcome};
use jobctl_core::config::ControllerConfig;
use jobctl_core::error::{StopError, SubmissionError};
use jobctl_core::injector::plan_injection;
use jobctl_core::job::{Job, JobRequest};
use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;
use jobctl_db::{CachedJob, StatusWriter};

use crate::hooks::{execute_with_hooks, ExecutionHooks, Prepared};

pub struct JobManager {
    backend: Arc<dyn JobBackend>,
    config: Arc<ControllerConfig>,
    writer: StatusWriter,
}

impl JobManager {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        config: Arc<ControllerConfig>,
        writer: StatusWriter,
    ) -> Self {
        Self {
            backend,
            config,
            writer,
        }
    }

    pub fn kind(&self) -> ComputeBackend {
        self.backend.kind()
    }

    /// Submit a job. The returned record is already persisted and
    /// visible to the backend's monitor.
    pub async fn execute(&self, request: &JobRequest) -> Result<Job, SubmissionError> {
        let backend = &self.backend;
        execute_with_hooks(self, request, |prepared| async move {
            backend.submit(prepared.job_id, request, &prepared.plan).await
        })
        .await
    }

    /// Cancel a job. Safe to call repeatedly: a terminal job is left
    /// untouched and a job the backend no longer knows counts as stopped.
    pub async fn stop(&self, job_id: JobId) -> Result<StopOutcome, StopError> {
        let job = self
            .writer
            .store()
            .get(job_id)
            .await
            .map_err(|e| StopError::Persistence(e.to_string()))?
            .ok_or(StopError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = %job.status, "Stop on finished job ignored");
            return Ok(StopOutcome::AlreadyTerminal);
        }
        let Some(backend_job_id) = job.backend_job_id.as_deref() else {
            return Err(StopError::Rejected(format!(
                "Job {job_id} has no backend job id"
            )));
        };

        let outcome = self.backend.stop(backend_job_id).await?;
        self.writer
            .apply(job_id, JobStatus::Stopped)
            .await
            .map_err(|e| StopError::Persistence(e.to_string()))?;

        tracing::info!(
            job_id = %job_id,
            backend = %self.kind(),
            backend_job_id = %backend_job_id,
            outcome = ?outcome,
            "Job stopped",
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ExecutionHooks for JobManager {
    async fn before_execution(&self, request: &JobRequest) -> Result<Prepared, SubmissionError> {
        request.validate()?;
        if request.backend() != self.kind() {
            return Err(SubmissionError::InvalidRequest(format!(
                "Request for {} routed to the {} manager",
                request.backend(),
                self.kind()
            )));
        }

        let plan = plan_injection(
            &self.config.injection,
            self.kind(),
            request.workflow_id(),
            request.requires_kerberos(),
        )?;
        self.backend.prepare(request, &plan).await?;

        Ok(Prepared {
            job_id: uuid::Uuid::now_v7(),
            workspace: request.workspace(&self.config.shared_volume_root),
            plan,
        })
    }

    async fn create_job_in_db(
        &self,
        prepared: &Prepared,
        request: &JobRequest,
        backend_job_id: &str,
    ) -> Result<Job, SubmissionError> {
        let job = Job::submitted(prepared.job_id, request, backend_job_id, chrono::Utc::now());
        let Err(e) = self.writer.store().create(&job).await else {
            return Ok(job);
        };

        // Nobody would ever observe or stop an unrecorded job.
        tracing::error!(
            job_id = %job.id,
            backend = %self.kind(),
            backend_job_id = %backend_job_id,
            error = %e,
            "Failed to record submitted job, cancelling it",
        );
        if let Err(stop_err) = self.backend.stop(backend_job_id).await {
            tracing::error!(
                backend_job_id = %backend_job_id,
                error = %stop_err,
                "Compensating cancellation failed, backend job is orphaned",
            );
        }
        Err(SubmissionError::Persistence(e.to_string()))
    }

    async fn cache_job(&self, prepared: &Prepared, job: &Job) {
        let Some(backend_job_id) = job.backend_job_id.clone() else {
            return;
        };
        self.writer
            .cache()
            .insert(CachedJob {
                job_id: job.id,
                backend: job.backend,
                backend_job_id,
                workflow_id: job.workflow_id,
                workspace: prepared.workspace.clone(),
                status: job.status,
                cached_at: job.created_at,
            })
            .await;

        tracing::info!(
            job_id = %job.id,
            backend = %job.backend,
            workflow_id = %job.workflow_id,
            "Job dispatched",
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use jobctl_core::injector::InjectionPlan;
    use jobctl_db::{InMemoryJobStore, JobCache, JobStore};
    use uuid::Uuid;

    use super::*;

    /// Backend that records calls and answers from flags.
    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        reject: bool,
        gone: bool,
    }

    #[async_trait]
    impl JobBackend for FakeBackend {
        fn kind(&self) -> ComputeBackend {
            ComputeBackend::Slurm
        }

        async fn prepare(
            &self,
            _request: &JobRequest,
            plan: &InjectionPlan,
        ) -> Result<(), SubmissionError> {
            let staged = plan.ticket_staging.is_some();
            self.calls.lock().unwrap().push(format!("prepare:{staged}"));
            Ok(())
        }

        async fn submit(
            &self,
            _job_id: JobId,
            _request: &JobRequest,
            _plan: &InjectionPlan,
        ) -> Result<String, SubmissionError> {
            self.calls.lock().unwrap().push("submit".into());
            if self.reject {
                return Err(SubmissionError::Rejected("QOSMaxSubmitJobPerUserLimit".into()));
            }
            Ok("4711".into())
        }

        async fn stop(&self, backend_job_id: &str) -> Result<StopOutcome, StopError> {
            self.calls.lock().unwrap().push(format!("stop:{backend_job_id}"));
            Ok(if self.gone {
                StopOutcome::AlreadyGone
            } else {
                StopOutcome::Stopped
            })
        }
    }

    fn setup(backend: FakeBackend) -> (Arc<FakeBackend>, Arc<InMemoryJobStore>, JobCache, JobManager) {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryJobStore::new());
        let cache = JobCache::new();
        let config = ControllerConfig::from_lookup(|key| match key {
            "COMPUTE_BACKENDS" => Some("slurmcern".into()),
            "DEFAULT_COMPUTE_BACKEND" => Some("slurmcern".into()),
            "KRB5_PRINCIPAL" => Some("reana@CERN.CH".into()),
            _ => None,
        })
        .unwrap();
        let manager = JobManager::new(
            backend.clone(),
            Arc::new(config),
            StatusWriter::new(store.clone(), cache.clone()),
        );
        (backend, store, cache, manager)
    }

    fn request() -> JobRequest {
        JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4())
            .with_backend(ComputeBackend::Slurm)
    }

    fn calls(backend: &FakeBackend) -> Vec<String> {
        backend.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn execute_persists_and_caches() {
        let (backend, store, cache, manager) = setup(FakeBackend::default());
        let job = manager.execute(&request().with_kerberos(true)).await.unwrap();

        assert_eq!(calls(&backend), ["prepare:true", "submit"]);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Submitted);
        assert_eq!(stored.backend_job_id.as_deref(), Some("4711"));
        let cached = cache.get(job.id).await.unwrap();
        assert_eq!(cached.backend_job_id, "4711");
        assert_eq!(
            cached.workspace,
            std::path::Path::new("/var/reana").join(job.workflow_id.to_string())
        );
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_backend() {
        let (backend, store, _cache, manager) = setup(FakeBackend::default());
        let request = JobRequest::new("", vec!["ls".into()], Uuid::new_v4())
            .with_backend(ComputeBackend::Slurm);

        assert_matches!(
            manager.execute(&request).await,
            Err(SubmissionError::InvalidRequest(_))
        );
        assert!(calls(&backend).is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rejected_submission_leaves_no_record() {
        let (_backend, store, cache, manager) = setup(FakeBackend {
            reject: true,
            ..Default::default()
        });
        assert_matches!(
            manager.execute(&request()).await,
            Err(SubmissionError::Rejected(_))
        );
        assert!(store.is_empty().await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn persistence_failure_cancels_backend_job() {
        let (backend, store, cache, manager) = setup(FakeBackend::default());
        store.set_unavailable(true);

        assert_matches!(
            manager.execute(&request()).await,
            Err(SubmissionError::Persistence(_))
        );
        assert_eq!(calls(&backend), ["prepare:false", "submit", "stop:4711"]);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent() {
        let (backend, store, cache, manager) = setup(FakeBackend::default());
        let job = manager.execute(&request()).await.unwrap();

        assert_eq!(manager.stop(job.id).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(manager.stop(job.id).await.unwrap(), StopOutcome::AlreadyTerminal);

        assert_eq!(
            calls(&backend).iter().filter(|c| c.starts_with("stop")).count(),
            1
        );
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Stopped);
        assert!(cache.get(job.id).await.is_none());
    }

    #[tokio::test]
    async fn stop_of_vanished_backend_job_still_records_stopped() {
        let (_backend, store, _cache, manager) = setup(FakeBackend {
            gone: true,
            ..Default::default()
        });
        let job = manager.execute(&request()).await.unwrap();

        assert_eq!(manager.stop(job.id).await.unwrap(), StopOutcome::AlreadyGone);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_unknown_job() {
        let (_backend, _store, _cache, manager) = setup(FakeBackend::default());
        let id = Uuid::new_v4();
        assert_matches!(manager.stop(id).await, Err(StopError::JobNotFound(missing)) if missing == id);
    }
}
