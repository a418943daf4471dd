//! HTCondor backend (`htcondorcern`).
//!
//! Jobs run in the docker universe. The submit description is piped to
//! `condor_submit -terse`; queue state comes from `condor_q` and, once a
//! job has left the queue, from `condor_history`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use jobctl_core::backend::{ComputeBackend, JobBackend, StopOutcome};
use jobctl_core::error::{ObservationError, StopError, SubmissionError};
use jobctl_core::injector::InjectionPlan;
use jobctl_core::job::JobRequest;
use jobctl_core::status::JobStatus;
use jobctl_core::types::JobId;
use jobctl_db::CachedJob;
use regex::Regex;

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::monitor::{read_files, BatchProbe};
use crate::staging::{self, output_file, BatchSettings, CONTROL_DIR};

/// `condor_submit -terse` prints `<first> - <last>` job ids.
static CLUSTER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\.\d+").expect("valid regex"));

/// Hold reasons that resolve themselves (spooling, transfer retries).
const TRANSIENT_HOLD_CODES: &[u32] = &[16, 35];

pub struct HtCondorBackend {
    runner: Arc<dyn CommandRunner>,
    settings: BatchSettings,
}

impl HtCondorBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: BatchSettings) -> Self {
        Self { runner, settings }
    }

    /// Submit description for one job.
    pub fn submit_description(&self, request: &JobRequest, plan: &InjectionPlan) -> String {
        let workspace = request.workspace(&self.settings.shared_volume_root);
        let env = staging::job_environment(
            request,
            plan,
            &workspace,
            &self.settings.pull_secrets_dir,
        );
        let (executable, arguments) = match request.command().split_first() {
            Some((first, rest)) => (first.as_str(), rest),
            None => ("", &[][..]),
        };

        let mut desc = String::new();
        let _ = writeln!(desc, "universe = docker");
        let _ = writeln!(desc, "docker_image = {}", request.docker_image());
        let _ = writeln!(desc, "executable = {executable}");
        if !arguments.is_empty() {
            let _ = writeln!(desc, "arguments = {}", condor_list(arguments.iter().cloned()));
        }
        if !env.is_empty() {
            let vars = env.iter().map(|(k, v)| format!("{k}={}", condor_word(v)));
            let _ = writeln!(desc, "environment = \"{}\"", vars.collect::<Vec<_>>().join(" "));
        }
        if let Some(name) = request.job_name() {
            let _ = writeln!(desc, "batch_name = {name}");
        }
        let _ = writeln!(desc, "initialdir = {}", workspace.display());
        for (key, ext) in [("output", "out"), ("error", "err"), ("log", "log")] {
            let _ = writeln!(desc, "{key} = {CONTROL_DIR}/$(Cluster).{ext}");
        }

        let resources = request.resources();
        if let Some(cpus) = resources.whole_cpus() {
            let _ = writeln!(desc, "request_cpus = {cpus}");
        }
        if let Some(memory) = resources.memory_mb {
            let _ = writeln!(desc, "request_memory = {memory}");
        }
        if let Some(gpus) = resources.gpus {
            let _ = writeln!(desc, "request_gpus = {gpus}");
        }

        if request.shared_file_system() {
            let _ = writeln!(desc, "should_transfer_files = NO");
        } else {
            let _ = writeln!(desc, "should_transfer_files = YES");
            let _ = writeln!(desc, "when_to_transfer_output = ON_EXIT");
            let _ = writeln!(desc, "transfer_input_files = {}", workspace.display());
        }
        let _ = writeln!(desc, "queue 1");
        desc
    }

    // ---- private helpers ----

    /// `ClusterId == a || ClusterId == b ...`
    fn cluster_constraint<'a>(ids: impl Iterator<Item = &'a str>) -> String {
        ids.map(|id| format!("ClusterId == {id}"))
            .collect::<Vec<_>>()
            .join(" || ")
    }

    async fn run_query(&self, spec: CommandSpec) -> Result<String, ObservationError> {
        let output = self.runner.run(&spec).await.map_err(transient)?;
        if !output.success() {
            return Err(ObservationError::Transient(format!(
                "{} exited with {}: {}",
                spec.program,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl JobBackend for HtCondorBackend {
    fn kind(&self) -> ComputeBackend {
        ComputeBackend::HtCondor
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
        let spec = CommandSpec::new("condor_submit", ["-terse"])
            .with_stdin(self.submit_description(request, plan));
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(staging::unreachable)?;
        if !output.success() {
            return Err(SubmissionError::Rejected(format!(
                "condor_submit exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let cluster_id = parse_cluster_id(&output.stdout).ok_or_else(|| {
            SubmissionError::Rejected(format!(
                "Unexpected condor_submit output: {}",
                output.stdout.trim()
            ))
        })?;

        tracing::info!(
            job_id = %job_id,
            cluster_id = %cluster_id,
            image = %request.docker_image(),
            "HTCondor job submitted",
        );
        Ok(cluster_id)
    }

    async fn stop(&self, backend_job_id: &str) -> Result<StopOutcome, StopError> {
        let spec = CommandSpec::new("condor_rm", [backend_job_id]);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| StopError::Unreachable(e.to_string()))?;
        if output.success() {
            return Ok(StopOutcome::Stopped);
        }
        if output.mentions("Couldn't find") || output.mentions("not found") {
            return Ok(StopOutcome::AlreadyGone);
        }
        Err(StopError::Rejected(format!(
            "condor_rm {backend_job_id} exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

#[async_trait]
impl BatchProbe for HtCondorBackend {
    fn backend(&self) -> ComputeBackend {
        ComputeBackend::HtCondor
    }

    async fn query(
        &self,
        jobs: &[CachedJob],
    ) -> Result<HashMap<String, Option<JobStatus>>, ObservationError> {
        let constraint = Self::cluster_constraint(jobs.iter().map(|j| j.backend_job_id.as_str()));
        let stdout = self
            .run_query(CommandSpec::new(
                "condor_q",
                [
                    "-constraint",
                    constraint.as_str(),
                    "-af",
                    "ClusterId",
                    "JobStatus",
                    "ExitCode",
                    "HoldReasonCode",
                ],
            ))
            .await?;

        let mut states = HashMap::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(cluster), Some(Some(code))) =
                (fields.first(), fields.get(1).map(|f| attr::<u32>(f)))
            else {
                tracing::warn!(line = %line, "Skipping unparsable condor_q line");
                continue;
            };
            let exit_code = fields.get(2).and_then(|f| attr::<i32>(f));
            let hold_reason = fields.get(3).and_then(|f| attr::<u32>(f));
            states.insert(
                cluster.to_string(),
                map_job_status(code, exit_code, hold_reason),
            );
        }
        Ok(states)
    }

    async fn side_channel(&self, job: &CachedJob) -> Result<Option<JobStatus>, ObservationError> {
        let constraint = Self::cluster_constraint(std::iter::once(job.backend_job_id.as_str()));
        let stdout = self
            .run_query(CommandSpec::new(
                "condor_history",
                [
                    "-constraint",
                    constraint.as_str(),
                    "-limit",
                    "1",
                    "-af",
                    "JobStatus",
                    "ExitCode",
                ],
            ))
            .await?;

        let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let mut fields = line.split_whitespace();
        let code = fields
            .next()
            .and_then(attr::<u32>)
            .ok_or_else(|| ObservationError::Malformed(format!("condor_history: {line}")))?;
        let exit_code = fields.next().and_then(attr::<i32>);
        Ok(map_job_status(code, exit_code, None).filter(|s| s.is_terminal()))
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

    async fn after_terminal(&self, job: &CachedJob, status: JobStatus) {
        // Held jobs stay in the queue until removed.
        if status != JobStatus::Failed {
            return;
        }
        if let Err(e) = self.stop(&job.backend_job_id).await {
            tracing::debug!(
                job_id = %job.job_id,
                cluster_id = %job.backend_job_id,
                error = %e,
                "Failed to remove finished job from queue",
            );
        }
    }
}

/// Cluster id from `condor_submit -terse` output.
pub fn parse_cluster_id(stdout: &str) -> Option<String> {
    CLUSTER_ID_RE
        .captures(stdout)
        .map(|c| c[1].to_string())
}

/// Canonical status of an HTCondor `JobStatus` code. `None` leaves the
/// record untouched.
pub fn map_job_status(
    code: u32,
    exit_code: Option<i32>,
    hold_reason: Option<u32>,
) -> Option<JobStatus> {
    match code {
        // Idle, or unexpanded.
        0 | 1 => Some(JobStatus::Submitted),
        2 => Some(JobStatus::Running),
        3 => Some(JobStatus::Stopped),
        4 => match exit_code {
            Some(0) => Some(JobStatus::Succeeded),
            _ => Some(JobStatus::Failed),
        },
        5 => match hold_reason {
            Some(reason) if TRANSIENT_HOLD_CODES.contains(&reason) => None,
            _ => Some(JobStatus::Failed),
        },
        // Submission error.
        6 => Some(JobStatus::Failed),
        _ => None,
    }
}

// ---- private helpers ----

/// ClassAd attribute value; `undefined` parses as `None`.
fn attr<T: std::str::FromStr>(field: &str) -> Option<T> {
    field.parse().ok()
}

/// One word of a new-syntax `arguments`/`environment` value.
fn condor_word(word: &str) -> String {
    let escaped = word.replace('"', "\"\"");
    if escaped.is_empty() || escaped.contains([' ', '\t', '\'']) {
        format!("'{}'", escaped.replace('\'', "''"))
    } else {
        escaped
    }
}

fn condor_list(words: impl Iterator<Item = String>) -> String {
    let words: Vec<String> = words.map(|w| condor_word(&w)).collect();
    format!("\"{}\"", words.join(" "))
}

fn transient(err: CommandError) -> ObservationError {
    ObservationError::Transient(err.to_string())
}
