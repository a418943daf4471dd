//! The submission lifecycle shared by every backend.
//!
//! [`execute_with_hooks`] is the only place the order is encoded:
//! `before_execution`, the backend submission, `create_job_in_db`, then
//! `cache_job`. A failing step stops the sequence; later steps never run.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use jobctl_core::error::SubmissionError;
use jobctl_core::injector::InjectionPlan;
use jobctl_core::job::{Job, JobRequest};
use jobctl_core::types::JobId;

/// Output of `before_execution`, handed to the remaining steps.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub job_id: JobId,
    pub workspace: PathBuf,
    pub plan: InjectionPlan,
}

#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// Validate the request, resolve its workspace, and plan injection.
    async fn before_execution(&self, request: &JobRequest) -> Result<Prepared, SubmissionError>;

    /// Persist the submitted job.
    async fn create_job_in_db(
        &self,
        prepared: &Prepared,
        request: &JobRequest,
        backend_job_id: &str,
    ) -> Result<Job, SubmissionError>;

    /// Make the job visible to the backend's monitor.
    async fn cache_job(&self, prepared: &Prepared, job: &Job);
}

/// Run the submission lifecycle around `submit`.
pub async fn execute_with_hooks<H, F, Fut>(
    hooks: &H,
    request: &JobRequest,
    submit: F,
) -> Result<Job, SubmissionError>
where
    H: ExecutionHooks + ?Sized,
    F: FnOnce(Prepared) -> Fut,
    Fut: Future<Output = Result<String, SubmissionError>>,
{
    let prepared = hooks.before_execution(request).await?;
    let backend_job_id = submit(prepared.clone()).await?;
    let job = hooks
        .create_job_in_db(&prepared, request, &backend_job_id)
        .await?;
    hooks.cache_job(&prepared, &job).await;
    Ok(job)
}
