//! Canonical job request and job record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::ComputeBackend;
use crate::error::CoreError;
use crate::status::JobStatus;
use crate::types::{JobId, Timestamp, WorkflowId};

/// Optional resource needs of a job. The backend does the actual
/// scheduling; these only become requests/limits in the submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// CPU in millicores (`1000` = one core).
    pub cpu_millicores: Option<u32>,
    /// Memory in MiB.
    pub memory_mb: Option<u64>,
    /// Number of GPUs.
    pub gpus: Option<u32>,
}

impl ResourceHints {
    /// Whole cores, rounded up. HPC schedulers only accept integers.
    pub fn whole_cpus(&self) -> Option<u32> {
        self.cpu_millicores.map(|m| m.div_ceil(1000).max(1))
    }
}

/// A request to run one workflow step on one compute backend.
///
/// Immutable once built: construct with [`JobRequest::new`] and the
/// consuming `with_*` methods, then call [`JobRequest::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    docker_image: String,
    command: Vec<String>,
    env_vars: BTreeMap<String, String>,
    workflow_id: WorkflowId,
    backend: ComputeBackend,
    resources: ResourceHints,
    workflow_workspace: Option<PathBuf>,
    job_name: Option<String>,
    requires_kerberos: bool,
    shared_file_system: bool,
}

impl JobRequest {
    /// Create a request for the default Kubernetes backend with no env
    /// vars, no resource hints, and no Kerberos.
    pub fn new(
        docker_image: impl Into<String>,
        command: Vec<String>,
        workflow_id: WorkflowId,
    ) -> Self {
        Self {
            docker_image: docker_image.into(),
            command,
            env_vars: BTreeMap::new(),
            workflow_id,
            backend: ComputeBackend::Kubernetes,
            resources: ResourceHints::default(),
            workflow_workspace: None,
            job_name: None,
            requires_kerberos: false,
            shared_file_system: true,
        }
    }

    pub fn with_env_vars(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(name.into(), value.into());
        self
    }

    pub fn with_backend(mut self, backend: ComputeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_resources(mut self, resources: ResourceHints) -> Self {
        self.resources = resources;
        self
    }

    /// Override the workspace path (defaults to
    /// `<shared_volume_root>/<workflow_id>`).
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workflow_workspace = Some(workspace.into());
        self
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }

    pub fn with_kerberos(mut self, requires_kerberos: bool) -> Self {
        self.requires_kerberos = requires_kerberos;
        self
    }

    pub fn with_shared_file_system(mut self, shared: bool) -> Self {
        self.shared_file_system = shared;
        self
    }

    pub fn docker_image(&self) -> &str {
        &self.docker_image
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env_vars
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    pub fn resources(&self) -> &ResourceHints {
        &self.resources
    }

    pub fn job_name(&self) -> Option<&str> {
        self.job_name.as_deref()
    }

    pub fn requires_kerberos(&self) -> bool {
        self.requires_kerberos
    }

    pub fn shared_file_system(&self) -> bool {
        self.shared_file_system
    }

    /// The workspace given with [`JobRequest::with_workspace`], if any.
    pub fn explicit_workspace(&self) -> Option<&Path> {
        self.workflow_workspace.as_deref()
    }

    /// Workspace of the owning workflow, resolved against the shared
    /// volume root when no explicit path was given.
    pub fn workspace(&self, shared_volume_root: &Path) -> PathBuf {
        match &self.workflow_workspace {
            Some(path) => path.clone(),
            None => shared_volume_root.join(self.workflow_id.to_string()),
        }
    }

    /// Check the request before any backend work happens.
    ///
    /// Rules:
    /// - The image must not be empty or contain whitespace.
    /// - The command must have at least one non-empty element.
    /// - Env var names must match `[A-Za-z_][A-Za-z0-9_]*`.
    /// - An explicit workspace must be an absolute path.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.docker_image.trim().is_empty() {
            return Err(CoreError::Validation(
                "docker_image must not be empty".to_string(),
            ));
        }
        if self.docker_image.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "docker_image '{}' must not contain whitespace",
                self.docker_image
            )));
        }
        if self.command.is_empty() || self.command.iter().all(|c| c.is_empty()) {
            return Err(CoreError::Validation(
                "command must not be empty".to_string(),
            ));
        }
        if let Some(name) = self.env_vars.keys().find(|k| !is_valid_env_name(k)) {
            return Err(CoreError::Validation(format!(
                "Invalid environment variable name: '{name}'"
            )));
        }
        if let Some(ws) = &self.workflow_workspace {
            if !ws.is_absolute() {
                return Err(CoreError::Validation(format!(
                    "workflow workspace '{}' must be an absolute path",
                    ws.display()
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The durable record of one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub backend_job_id: Option<String>,
    pub status: JobStatus,
    pub workflow_id: WorkflowId,
    pub backend: ComputeBackend,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Explicit workspace of the request. `None` means the default
    /// location under the shared volume root.
    pub workspace: Option<PathBuf>,
    /// Collected container / batch logs once the job is terminal.
    pub logs: Option<String>,
}

impl Job {
    /// Build the record written by `create_job_in_db`: status SUBMITTED
    /// with the backend-assigned id attached.
    pub fn submitted(
        id: JobId,
        request: &JobRequest,
        backend_job_id: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            backend_job_id: Some(backend_job_id.into()),
            status: JobStatus::Submitted,
            workflow_id: request.workflow_id(),
            backend: request.backend(),
            created_at: now,
            updated_at: now,
            workspace: request.explicit_workspace().map(Path::to_path_buf),
            logs: None,
        }
    }

    /// Workspace the job ran in, resolved the same way as
    /// [`JobRequest::workspace`].
    pub fn resolve_workspace(&self, shared_volume_root: &Path) -> PathBuf {
        match &self.workspace {
            Some(path) => path.clone(),
            None => shared_volume_root.join(self.workflow_id.to_string()),
        }
    }
}
