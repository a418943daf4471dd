//! Slurm backend (`slurmcern`).
//!
//! A batch script wrapping `singularity exec` is piped to
//! `sbatch --parsable`. The script records the container's exit code in
//! the control directory, which the monitor reads once `sacct` has
//! forgotten the job.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use jobctl_core::backend::{ComputeBackend, JobBackend, StopOutcome};
use jobctl_core::config::SlurmConfig;
use jobctl_core::error::{ObservationError, StopError, SubmissionError};
use jobctl_core::injector::InjectionPlan;
use jobctl_core::job::JobRequest;
use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;
use jobctl_db::CachedJob;

use crate::command::{shell_quote, CommandRunner, CommandSpec};
use crate::monitor::{read_files, BatchProbe};
use crate::staging::{self, control_dir, output_file, BatchSettings};

pub struct SlurmBackend {
    runner: Arc<dyn CommandRunner>,
    settings: BatchSettings,
    partition: String,
}

impl SlurmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: BatchSettings, config: &SlurmConfig) -> Self {
        Self {
            runner,
            settings,
            partition: config.partition.clone(),
        }
    }

    /// Batch script for one job.
    pub fn batch_script(&self, job_id: JobId, request: &JobRequest, plan: &InjectionPlan) -> String {
        let workspace = request.workspace(&self.settings.shared_volume_root);
        let ws = workspace.display().to_string();
        let control = control_dir(&workspace).display().to_string();
        let name = request
            .job_name()
            .map(sanitize_job_name)
            .unwrap_or_else(|| format!("jobctl-{job_id}"));

        let mut script = String::from("#!/bin/bash\n");
        let _ = writeln!(script, "#SBATCH --partition={}", self.partition);
        let _ = writeln!(script, "#SBATCH --job-name={name}");
        let _ = writeln!(script, "#SBATCH --chdir={ws}");
        let _ = writeln!(script, "#SBATCH --output={control}/%j.out");
        let _ = writeln!(script, "#SBATCH --error={control}/%j.err");
        let resources = request.resources();
        if let Some(cpus) = resources.whole_cpus() {
            let _ = writeln!(script, "#SBATCH --cpus-per-task={cpus}");
        }
        if let Some(memory) = resources.memory_mb {
            let _ = writeln!(script, "#SBATCH --mem={memory}M");
        }
        if let Some(gpus) = resources.gpus {
            let _ = writeln!(script, "#SBATCH --gpus={gpus}");
        }

        let env = staging::job_environment(request, plan, &workspace, &self.settings.pull_secrets_dir);
        for (key, value) in &env {
            let _ = writeln!(script, "export {key}={}", shell_quote(value));
        }

        let command: Vec<String> = request.command().iter().map(|w| shell_quote(w)).collect();
        let _ = writeln!(
            script,
            "singularity exec --bind {ws}:{ws} --pwd {ws} {} {}",
            shell_quote(&format!("docker://{}", request.docker_image())),
            command.join(" "),
            ws = shell_quote(&ws),
        );
        let _ = writeln!(script, "rc=$?");
        let _ = writeln!(
            script,
            "echo \"$rc\" > {}/\"$SLURM_JOB_ID\".exitcode",
            shell_quote(&control)
        );
        let _ = writeln!(script, "exit $rc");
        script
    }
}

#[async_trait]
impl JobBackend for SlurmBackend {
    fn kind(&self) -> ComputeBackend {
        ComputeBackend::Slurm
    }

    async fn prepare(
        &self,
        request: &JobRequest,
        plan: &InjectionPlan,
    ) -> Result<(), SubmissionError> {
        let workspace = request.workspace(&self.settings.shared_volume_root);
        staging::prepare_workspace(
            self.runner.as_ref(),
            plan,
            &workspace,
            &self.settings.pull_secrets_dir,
        )
        .await
    }

    async fn submit(
        &self,
        job_id: JobId,
        request: &JobRequest,
        plan: &InjectionPlan,
    ) -> Result<String, SubmissionError> {
        let spec = CommandSpec::new("sbatch", ["--parsable"])
            .with_stdin(self.batch_script(job_id, request, plan));
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(staging::unreachable)?;
        if !output.success() {
            return Err(SubmissionError::Rejected(format!(
                "sbatch exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let slurm_id = parse_job_id(&output.stdout).ok_or_else(|| {
            SubmissionError::Rejected(format!("Unexpected sbatch output: {}", output.stdout.trim()))
        })?;

        tracing::info!(
            job_id = %job_id,
            slurm_id = %slurm_id,
            partition = %self.partition,
            "Slurm job submitted",
        );
        Ok(slurm_id)
    }

    async fn stop(&self, backend_job_id: &str) -> Result<StopOutcome, StopError> {
        let spec = CommandSpec::new("scancel", [backend_job_id]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| StopError::Unreachable(e.to_string()))?;
        // scancel may exit 0 while reporting an unknown id.
        if output.mentions("Invalid job id specified") {
            return Ok(StopOutcome::AlreadyGone);
        }
        if output.success() {
            return Ok(StopOutcome::Stopped);
        }
        Err(StopError::Rejected(format!(
            "scancel {backend_job_id} exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

#[async_trait]
impl BatchProbe for SlurmBackend {
    fn backend(&self) -> ComputeBackend {
        ComputeBackend::Slurm
    }

    async fn query(
        &self,
        jobs: &[CachedJob],
    ) -> Result<HashMap<String, Option<JobStatus>>, ObservationError> {
        let ids = jobs
            .iter()
            .map(|j| j.backend_job_id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let spec = CommandSpec::new(
            "sacct",
            [
                "--jobs",
                ids.as_str(),
                "--noheader",
                "--allocations",
                "--parsable2",
                "--format",
                "JobID,State,ExitCode",
            ],
        );
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| ObservationError::Transient(e.to_string()))?;
        if !output.success() {
            return Err(ObservationError::Transient(format!(
                "sacct exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let mut states = HashMap::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let mut fields = line.split('|');
            let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
                tracing::warn!(line = %line, "Skipping unparsable sacct line");
                continue;
            };
            let exit_code = fields
                .next()
                .and_then(|f| f.split(':').next())
                .and_then(|code| code.parse::<i32>().ok());
            states.insert(id.to_string(), map_state(state, exit_code));
        }
        Ok(states)
    }

    async fn side_channel(&self, job: &CachedJob) -> Result<Option<JobStatus>, ObservationError> {
        let path = exit_code_file(&job.workspace, &job.backend_job_id);
        let spec = CommandSpec::new("cat", [path.display().to_string()]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| ObservationError::Transient(e.to_string()))?;
        if !output.success() {
            // Not written (yet).
            return Ok(None);
        }
        match output.stdout.trim().parse::<i32>() {
            Ok(0) => Ok(Some(JobStatus::Succeeded)),
            Ok(_) => Ok(Some(JobStatus::Failed)),
            Err(_) => Err(ObservationError::Malformed(format!(
                "{}: {:?}",
                path.display(),
                output.stdout.trim()
            ))),
        }
    }

    async fn collect_logs(&self, job: &CachedJob) -> Option<String> {
        read_files(
            self.runner.as_ref(),
            &[
                output_file(&job.workspace, &job.backend_job_id, "out"),
                output_file(&job.workspace, &job.backend_job_id, "err"),
            ],
        )
        .await
    }
}

/// Slurm job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Canonical status of a Slurm job state. `None` for states with no
/// canonical meaning.
pub fn map_state(state: &str, exit_code: Option<i32>) -> Option<JobStatus> {
    // "CANCELLED by 1000"
    let state = state.split_whitespace().next().unwrap_or_default();
    match state {
        "COMPLETED" => match exit_code {
            Some(0) | None => Some(JobStatus::Succeeded),
            Some(_) => Some(JobStatus::Failed),
        },
        "CANCELLED" => Some(JobStatus::Stopped),
        "BOOT_FAIL" | "DEADLINE" | "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "TIMEOUT" | "SUSPENDED" | "STOPPED" => Some(JobStatus::Failed),
        "CONFIGURING" | "COMPLETING" | "RUNNING" | "STAGE_OUT" => Some(JobStatus::Running),
        "PENDING" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESV_DEL_HOLD" | "REQUEUED"
        | "RESIZING" => Some(JobStatus::Submitted),
        _ => None,
    }
}

pub fn exit_code_file(workspace: &Path, backend_job_id: &str) -> std::path::PathBuf {
    output_file(workspace, backend_job_id, "exitcode")
}

// ---- private helpers ----

fn sanitize_job_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}
