//! Kubernetes half of the job manager: submission creates a Job,
//! cancellation deletes it.

use std::sync::Arc;

use async_trait::async_trait;
use jobctl_core::backend::{ComputeBackend, JobBackend, StopOutcome};
use jobctl_core::error::{StopError, SubmissionError};
use jobctl_core::injector::InjectionPlan;
use jobctl_core::job::JobRequest;
use jobctl_core::types::JobId;

use crate::api::{DeleteOutcome, KubeApiError, KubernetesClient};
use crate::manifest::{build_job_manifest, ManifestSettings};

pub struct KubernetesBackend {
    client: Arc<dyn KubernetesClient>,
    settings: ManifestSettings,
}

impl KubernetesBackend {
    pub fn new(client: Arc<dyn KubernetesClient>, settings: ManifestSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl JobBackend for KubernetesBackend {
    fn kind(&self) -> ComputeBackend {
        ComputeBackend::Kubernetes
    }

    async fn submit(
        &self,
        job_id: JobId,
        request: &JobRequest,
        plan: &InjectionPlan,
    ) -> Result<String, SubmissionError> {
        let manifest = build_job_manifest(job_id, request, plan, &self.settings);
        let name = manifest.name().to_string();

        self.client.create_job(&manifest).await.map_err(|e| {
            tracing::warn!(job_id = %job_id, error = %e, "Kubernetes job creation failed");
            submission_error(e)
        })?;

        tracing::info!(
            job_id = %job_id,
            backend_job_id = %name,
            namespace = %self.settings.namespace,
            image = request.docker_image(),
            kerberos = plan.sidecar.is_some(),
            "Kubernetes job created",
        );
        Ok(name)
    }

    async fn stop(&self, backend_job_id: &str) -> Result<StopOutcome, StopError> {
        match self.client.delete_job(backend_job_id).await {
            Ok(DeleteOutcome::Deleted) => {
                tracing::info!(backend_job_id, "Kubernetes job deleted");
                Ok(StopOutcome::Stopped)
            }
            Ok(DeleteOutcome::NotFound) => {
                tracing::debug!(backend_job_id, "Kubernetes job already gone");
                Ok(StopOutcome::AlreadyGone)
            }
            Err(e) if e.is_client_error() => Err(StopError::Rejected(e.to_string())),
            Err(e) => Err(StopError::Unreachable(e.to_string())),
        }
    }
}

fn submission_error(err: KubeApiError) -> SubmissionError {
    if err.is_client_error() {
        SubmissionError::Rejected(err.to_string())
    } else {
        SubmissionError::Unreachable(err.to_string())
    }
}
