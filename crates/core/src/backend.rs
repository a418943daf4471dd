//! The closed set of compute backends and the contract each one
//! implements for submission and cancellation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, StopError, SubmissionError};
use crate::injector::InjectionPlan;
use crate::job::JobRequest;
use crate::types::JobId;

/// A compute backend a job can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeBackend {
    #[serde(rename = "kubernetes")]
    Kubernetes,
    #[serde(rename = "htcondorcern")]
    HtCondor,
    #[serde(rename = "slurmcern")]
    Slurm,
}

impl ComputeBackend {
    /// Every known backend.
    pub const ALL: [ComputeBackend; 3] = [Self::Kubernetes, Self::HtCondor, Self::Slurm];

    /// Return the configuration name for this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::HtCondor => "htcondorcern",
            Self::Slurm => "slurmcern",
        }
    }

    /// Parse from a configuration name.
    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s.trim() {
            "kubernetes" => Ok(Self::Kubernetes),
            "htcondorcern" => Ok(Self::HtCondor),
            "slurmcern" => Ok(Self::Slurm),
            other => Err(CoreError::Configuration(format!(
                "Unknown compute backend: '{other}'. Must be one of: kubernetes, \
                 htcondorcern, slurmcern"
            ))),
        }
    }

    /// Whether the backend can run a sidecar container next to the job.
    ///
    /// Batch schedulers have no such concept and pre-stage the Kerberos
    /// ticket cache instead.
    pub fn supports_sidecar(&self) -> bool {
        matches!(self, Self::Kubernetes)
    }
}

impl std::fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful `stop()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The backend accepted the cancellation.
    Stopped,
    /// The backend no longer knows the job.
    AlreadyGone,
    /// The job record was already terminal; no backend call was made.
    AlreadyTerminal,
}

/// Backend-specific half of a job manager.
///
/// Implementations only translate a request into the backend's native
/// submission and cancellation calls. The lifecycle around
/// [`submit`](Self::submit) is owned by the dispatch layer and cannot be
/// reordered from here.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> ComputeBackend;

    /// Whether this backend attaches a Kerberos sidecar container.
    fn supports_sidecar(&self) -> bool {
        self.kind().supports_sidecar()
    }

    /// Backend-specific preparation run during `before_execution`, e.g.
    /// pre-staging a ticket cache into the job's working directory.
    async fn prepare(
        &self,
        _request: &JobRequest,
        _plan: &InjectionPlan,
    ) -> Result<(), SubmissionError> {
        Ok(())
    }

    /// Submit the job and return the backend-assigned job id.
    async fn submit(
        &self,
        job_id: JobId,
        request: &JobRequest,
        plan: &InjectionPlan,
    ) -> Result<String, SubmissionError>;

    /// Request cancellation. A backend "not found" answer must be
    /// reported as [`StopOutcome::AlreadyGone`], not as an error.
    async fn stop(&self, backend_job_id: &str) -> Result<StopOutcome, StopError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_configuration_values() {
        assert_eq!(ComputeBackend::Kubernetes.as_str(), "kubernetes");
        assert_eq!(ComputeBackend::HtCondor.as_str(), "htcondorcern");
        assert_eq!(ComputeBackend::Slurm.as_str(), "slurmcern");
        for backend in ComputeBackend::ALL {
            assert_eq!(ComputeBackend::from_str(backend.as_str()).unwrap(), backend);
        }
    }

    #[test]
    fn parsing_trims_whitespace() {
        assert_eq!(
            ComputeBackend::from_str(" slurmcern ").unwrap(),
            ComputeBackend::Slurm
        );
    }

    #[test]
    fn unknown_backend_is_configuration_error() {
        assert!(matches!(
            ComputeBackend::from_str("pbs"),
            Err(CoreError::Configuration(_))
        ));
    }

    #[test]
    fn only_kubernetes_supports_sidecars() {
        assert!(ComputeBackend::Kubernetes.supports_sidecar());
        assert!(!ComputeBackend::HtCondor.supports_sidecar());
        assert!(!ComputeBackend::Slurm.supports_sidecar());
    }

    #[test]
    fn serde_uses_configuration_names() {
        let json = serde_json::to_string(&ComputeBackend::HtCondor).unwrap();
        assert_eq!(json, "\"htcondorcern\"");
    }
}
