//! Polling monitor shared by the batch backends.
//!
//! Every poll interval the monitor queries the scheduler for all
//! outstanding jobs of its backend in one call. Jobs the queue no longer
//! lists are resolved through the backend's exit-code side channel;
//! jobs nobody can answer for accumulate misses and become UNKNOWN once
//! the budget is spent. A failed queue query backs off exponentially and
//! never changes any status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jobctl_core::backend::ComputeBackend;
use jobctl_core::backoff::{Backoff, BackoffConfig};
use jobctl_core::config::MonitorConfig;
use jobctl_core::error::{MonitorFatal, ObservationError};
use jobctl_core::observation::{MissTracker, MissVerdict};
use jobctl_core::status::JobStatus;
use jobctl_db::{CachedJob, StatusWriter};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, CommandSpec};

/// Scheduler-specific half of a polling monitor.
#[async_trait]
pub trait BatchProbe: Send + Sync {
    fn backend(&self) -> ComputeBackend;

    /// Query the queue for `jobs`. The map holds every job the
    /// scheduler still knows, keyed by backend job id; `None` means the
    /// native state carries no canonical change.
    async fn query(
        &self,
        jobs: &[CachedJob],
    ) -> Result<HashMap<String, Option<JobStatus>>, ObservationError>;

    /// Final status of a job the queue no longer lists. `Ok(None)` when
    /// the side channel has no answer (yet).
    async fn side_channel(&self, job: &CachedJob) -> Result<Option<JobStatus>, ObservationError>;

    /// Output of a finished job, if any could be read.
    async fn collect_logs(&self, job: &CachedJob) -> Option<String>;

    /// Scheduler cleanup once a terminal status has been recorded.
    async fn after_terminal(&self, _job: &CachedJob, _status: JobStatus) {}
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub outstanding: usize,
    pub applied: usize,
    pub missed: usize,
    pub query_failed: bool,
}

pub struct PollingMonitor {
    probe: Arc<dyn BatchProbe>,
    writer: StatusWriter,
    config: MonitorConfig,
    backoff: BackoffConfig,
    misses: Mutex<MissTracker>,
}

impl PollingMonitor {
    pub fn new(probe: Arc<dyn BatchProbe>, writer: StatusWriter, config: MonitorConfig) -> Self {
        let misses = Mutex::new(MissTracker::new(config.miss_budget));
        Self {
            probe,
            writer,
            config,
            backoff: BackoffConfig::default(),
            misses,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backend(&self) -> ComputeBackend {
        self.probe.backend()
    }

    /// Poll until `cancel` fires. Returns an error only when the job
    /// store is unavailable.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MonitorFatal> {
        let backend = self.backend();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.backoff.clone());

        tracing::info!(
            backend = %backend,
            poll_secs = self.config.poll_interval.as_secs(),
            "Batch monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let summary = self.poll_once().await?;
            if !summary.query_failed {
                backoff.reset();
                continue;
            }

            let delay = backoff.next();
            tracing::info!(
                backend = %backend,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Backing off before next status query",
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(backend = %backend, "Batch monitor stopped");
        Ok(())
    }

    /// Observe every outstanding job once.
    pub async fn poll_once(&self) -> Result<PollSummary, MonitorFatal> {
        let backend = self.backend();
        let jobs = self.writer.cache().outstanding(backend).await;
        let mut summary = PollSummary {
            outstanding: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }

        let native = match self.probe.query(&jobs).await {
            Ok(native) => native,
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "Batch status query failed");
                summary.query_failed = true;
                return Ok(summary);
            }
        };

        for job in &jobs {
            let observed = match native.get(&job.backend_job_id) {
                Some(status) => Some(*status),
                None => match self.probe.side_channel(job).await {
                    Ok(Some(status)) => Some(Some(status)),
                    Ok(None) => None,
                    Err(e) => {
                        // Neither a sighting nor a miss.
                        tracing::debug!(
                            job_id = %job.job_id,
                            backend_job_id = %job.backend_job_id,
                            error = %e,
                            "Exit-code lookup failed",
                        );
                        continue;
                    }
                },
            };

            match observed {
                Some(status) => {
                    self.misses.lock().await.record_seen(job.job_id);
                    if let Some(status) = status {
                        if self.apply(job, status).await? {
                            summary.applied += 1;
                        }
                    }
                }
                None => {
                    summary.missed += 1;
                    self.record_miss(job).await?;
                }
            }
        }

        Ok(summary)
    }

    // ---- private helpers ----

    /// Write an observed status. `Ok(true)` when the record changed.
    async fn apply(&self, job: &CachedJob, status: JobStatus) -> Result<bool, MonitorFatal> {
        let outcome = match self.writer.apply(job.job_id, status).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_unavailable() => {
                return Err(MonitorFatal::new(self.backend().as_str(), e));
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    status = %status,
                    error = %e,
                    "Failed to record job status",
                );
                return Ok(false);
            }
        };

        if outcome.is_applied() && status.is_terminal() {
            self.misses.lock().await.forget(job.job_id);
            self.probe.after_terminal(job, status).await;
            if let Some(logs) = self.probe.collect_logs(job).await {
                if let Err(e) = self.writer.store().store_logs(job.job_id, &logs).await {
                    if e.is_unavailable() {
                        return Err(MonitorFatal::new(self.backend().as_str(), e));
                    }
                    tracing::warn!(job_id = %job.job_id, error = %e, "Failed to store job logs");
                }
            }
        }
        Ok(outcome.is_applied())
    }

    async fn record_miss(&self, job: &CachedJob) -> Result<(), MonitorFatal> {
        let verdict = self.misses.lock().await.record_miss(job.job_id);
        match verdict {
            MissVerdict::Retry { misses } => {
                tracing::debug!(
                    job_id = %job.job_id,
                    backend_job_id = %job.backend_job_id,
                    misses,
                    "Job not found in queue or exit-code records",
                );
                Ok(())
            }
            MissVerdict::Exhausted { first } => {
                if first {
                    tracing::warn!(
                        job_id = %job.job_id,
                        backend = %job.backend,
                        backend_job_id = %job.backend_job_id,
                        "Cannot resolve job state, marking it unknown",
                    );
                }
                self.apply(job, JobStatus::Unknown).await.map(|_| ())
            }
        }
    }
}

/// Concatenate readable, non-empty files as `name:\ncontent\n` blocks.
pub async fn read_files(runner: &dyn CommandRunner, paths: &[PathBuf]) -> Option<String> {
    let mut logs = String::new();
    for path in paths {
        let spec = CommandSpec::new("cat", [path.display().to_string()]);
        match runner.run(&spec).await {
            Ok(output) if output.success() && !output.stdout.is_empty() => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                logs.push_str(&format!("{name}:\n{}\n", output.stdout));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Failed to read job output");
            }
        }
    }
    (!logs.is_empty()).then_some(logs)
}
