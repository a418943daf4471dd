use crate::status::JobStatus;
use crate::types::JobId;

/// Errors raised by pure domain logic (validation, configuration,
/// state-machine checks).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential injection failed: {0}")]
    CredentialInjection(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

/// Errors surfaced synchronously by `execute()`.
///
/// None of these are retried inside the job manager; the caller decides
/// whether to resubmit.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    /// The request failed validation before any backend call.
    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    /// The request names a backend that is unknown or not enabled.
    #[error("Compute backend '{0}' is not enabled")]
    BackendNotEnabled(String),

    /// Static configuration needed for this submission is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sidecar, volume, or pull-secret configuration is malformed.
    #[error("Credential injection failed: {0}")]
    CredentialInjection(String),

    /// The backend answered and refused the job (quota, bad manifest...).
    #[error("Backend rejected the job: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The job was submitted but its record could not be written.
    #[error("Failed to persist job: {0}")]
    Persistence(String),
}

impl From<CoreError> for SubmissionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::InvalidRequest(msg),
            CoreError::Configuration(msg) => Self::Configuration(msg),
            CoreError::CredentialInjection(msg) => Self::CredentialInjection(msg),
            CoreError::InvalidTransition { from, to } => {
                Self::Persistence(format!("invalid status transition {from} -> {to}"))
            }
        }
    }
}

/// Errors surfaced by `stop()`.
///
/// "Not found" answers from a backend are never reported here; they
/// count as already stopped.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    /// No job record exists for the given id.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// The backend refused the cancellation.
    #[error("Backend rejected the cancellation: {0}")]
    Rejected(String),

    /// The backend could not be reached.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The job record could not be read or updated.
    #[error("Failed to update job record: {0}")]
    Persistence(String),
}

/// A failed attempt to observe backend-native state.
///
/// Monitors retry these with backoff and log them; they are never
/// surfaced to callers and never change a job's status on their own.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObservationError {
    /// Timeout, connection reset, non-zero exit of a query command...
    #[error("Transient observation failure: {0}")]
    Transient(String),

    /// The backend answered with output we could not interpret.
    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

/// A monitor cannot continue: the job record store is gone.
///
/// The only error a monitor task returns. The supervisor treats it as a
/// reason to stop the whole process.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Monitor for {backend} stopped: {reason}")]
pub struct MonitorFatal {
    pub backend: String,
    pub reason: String,
}

impl MonitorFatal {
    pub fn new(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}
