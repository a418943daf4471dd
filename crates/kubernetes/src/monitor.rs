//! Kubernetes job monitor.
//!
//! A long-lived task cycling through three states:
//!
//! - **Resyncing**: list every Job pod, reconcile each cached job, and
//!   count a miss for cached jobs without a pod.
//! - **Watching**: stream pod events from the last resource version.
//! - **BackingOff**: wait with exponential backoff after a failure, then
//!   resume the watch (or resync if the list itself failed).
//!
//! An expired resource version (HTTP 410) and the periodic resync timer
//! both lead back to Resyncing, which catches events for jobs that were
//! not cached yet when their pod changed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use jobctl_core::backend::ComputeBackend;
use jobctl_core::backoff::{Backoff, BackoffConfig};
use jobctl_core::config::MonitorConfig;
use jobctl_core::error::MonitorFatal;
use jobctl_core::observation::{MissTracker, MissVerdict};
use jobctl_core::status::JobStatus;
use jobctl_db::{CachedJob, StatusWriter};
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::{KubeApiError, KubernetesClient, WatchStream};
use crate::pod::{canonical_status, Pod, WatchEvent};

/// HTTP status carried by watch `ERROR` events for expired versions.
const GONE: u16 = 410;

enum WatchState {
    Resyncing,
    Watching {
        resource_version: String,
    },
    BackingOff {
        delay: Duration,
        resume_from: Option<String>,
    },
}

/// Why a watch stream stopped being consumed.
enum WatchEnd {
    Cancelled,
    /// The server closed the stream normally (watch timeout).
    Ended { resource_version: String },
    Disconnected { resource_version: String },
    Expired,
    ResyncDue,
}

pub struct KubernetesMonitor {
    client: Arc<dyn KubernetesClient>,
    writer: StatusWriter,
    config: MonitorConfig,
    backoff: BackoffConfig,
    misses: Mutex<MissTracker>,
}

impl KubernetesMonitor {
    pub fn new(
        client: Arc<dyn KubernetesClient>,
        writer: StatusWriter,
        config: MonitorConfig,
    ) -> Self {
        let misses = Mutex::new(MissTracker::new(config.miss_budget));
        Self {
            client,
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

    /// Run until `cancel` fires. Returns an error only when the job
    /// store is unavailable.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MonitorFatal> {
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut resync_timer = tokio::time::interval_at(
            Instant::now() + self.config.resync_interval,
            self.config.resync_interval,
        );
        resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = WatchState::Resyncing;

        tracing::info!(
            resync_secs = self.config.resync_interval.as_secs(),
            "Kubernetes monitor started",
        );

        loop {
            state = match state {
                WatchState::Resyncing => {
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => break,
                        listed = self.resync_once() => listed?,
                    };
                    match listed {
                        Some(resource_version) => {
                            backoff.reset();
                            resync_timer.reset();
                            WatchState::Watching { resource_version }
                        }
                        None => WatchState::BackingOff {
                            delay: backoff.next(),
                            resume_from: None,
                        },
                    }
                }
                WatchState::Watching { resource_version } => {
                    let connected = tokio::select! {
                        _ = cancel.cancelled() => break,
                        connected = self.client.watch_job_pods(&resource_version) => connected,
                    };
                    match connected {
                        Ok(stream) => {
                            match self
                                .consume(stream, resource_version, &mut resync_timer, &cancel)
                                .await?
                            {
                                WatchEnd::Cancelled => break,
                                WatchEnd::Ended { resource_version } => {
                                    backoff.reset();
                                    WatchState::Watching { resource_version }
                                }
                                WatchEnd::Disconnected { resource_version } => {
                                    WatchState::BackingOff {
                                        delay: backoff.next(),
                                        resume_from: Some(resource_version),
                                    }
                                }
                                WatchEnd::Expired | WatchEnd::ResyncDue => WatchState::Resyncing,
                            }
                        }
                        Err(KubeApiError::Gone) => {
                            tracing::info!("Pod watch resource version expired, resyncing");
                            WatchState::Resyncing
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to open pod watch");
                            WatchState::BackingOff {
                                delay: backoff.next(),
                                resume_from: Some(resource_version),
                            }
                        }
                    }
                }
                WatchState::BackingOff { delay, resume_from } => {
                    tracing::info!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        resync = resume_from.is_none(),
                        "Reconnecting to Kubernetes",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match resume_from {
                        Some(resource_version) => WatchState::Watching { resource_version },
                        None => WatchState::Resyncing,
                    }
                }
            };
        }

        tracing::info!("Kubernetes monitor stopped");
        Ok(())
    }

    /// One full list-and-reconcile pass.
    ///
    /// Returns the list's resource version, or `None` when the pods
    /// could not be listed (logged, no status changes).
    pub async fn resync_once(&self) -> Result<Option<String>, MonitorFatal> {
        let list = match self.client.list_job_pods().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list job pods");
                return Ok(None);
            }
        };

        let mut seen = HashSet::new();
        for pod in &list.items {
            if let Some(job_name) = pod.job_name() {
                seen.insert(job_name.to_string());
            }
            self.handle_pod(pod).await?;
        }

        let outstanding = self.writer.cache().outstanding(ComputeBackend::Kubernetes).await;
        for cached in &outstanding {
            if !seen.contains(&cached.backend_job_id) {
                self.record_miss(cached).await?;
            }
        }

        tracing::debug!(
            pods = list.items.len(),
            outstanding = outstanding.len(),
            "Kubernetes resync complete",
        );
        Ok(Some(list.metadata.resource_version.unwrap_or_default()))
    }

    // ---- private helpers ----

    async fn consume(
        &self,
        mut stream: WatchStream,
        mut resource_version: String,
        resync_timer: &mut Interval,
        cancel: &CancellationToken,
    ) -> Result<WatchEnd, MonitorFatal> {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
                _ = resync_timer.tick() => return Ok(WatchEnd::ResyncDue),
                item = stream.next() => item,
            };

            let event = match item {
                None => return Ok(WatchEnd::Ended { resource_version }),
                Some(Err(KubeApiError::Gone)) => return Ok(WatchEnd::Expired),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Pod watch interrupted");
                    return Ok(WatchEnd::Disconnected { resource_version });
                }
                Some(Ok(event)) => event,
            };

            match event {
                WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                    if let Some(rv) = pod.resource_version() {
                        resource_version = rv.to_string();
                    }
                    self.handle_pod(&pod).await?;
                }
                WatchEvent::Deleted(pod) | WatchEvent::Bookmark(pod) => {
                    if let Some(rv) = pod.resource_version() {
                        resource_version = rv.to_string();
                    }
                }
                WatchEvent::Error(status) if status.code == Some(GONE) => {
                    return Ok(WatchEnd::Expired);
                }
                WatchEvent::Error(status) => {
                    tracing::warn!(
                        code = status.code,
                        reason = status.reason.as_deref().unwrap_or_default(),
                        message = status.message.as_deref().unwrap_or_default(),
                        "Pod watch returned an error event",
                    );
                    return Ok(WatchEnd::Disconnected { resource_version });
                }
            }
        }
    }

    async fn handle_pod(&self, pod: &Pod) -> Result<(), MonitorFatal> {
        let Some(job_name) = pod.job_name() else {
            return Ok(());
        };
        let Some(cached) = self
            .writer
            .cache()
            .find_by_backend_id(ComputeBackend::Kubernetes, job_name)
            .await
        else {
            return Ok(());
        };
        self.misses.lock().await.record_seen(cached.job_id);

        let Some(status) = canonical_status(pod) else {
            return Ok(());
        };
        if self.apply(&cached, status).await? && status.is_terminal() {
            self.finalize(&cached, pod).await?;
        }
        Ok(())
    }

    /// Write an observed status. `Ok(true)` when the record changed.
    async fn apply(&self, cached: &CachedJob, status: JobStatus) -> Result<bool, MonitorFatal> {
        match self.writer.apply(cached.job_id, status).await {
            Ok(outcome) => {
                if outcome.is_applied() && status.is_terminal() {
                    self.misses.lock().await.forget(cached.job_id);
                }
                Ok(outcome.is_applied())
            }
            Err(e) if e.is_unavailable() => {
                Err(MonitorFatal::new(ComputeBackend::Kubernetes.as_str(), e))
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %cached.job_id,
                    status = %status,
                    error = %e,
                    "Failed to record job status",
                );
                Ok(false)
            }
        }
    }

    async fn record_miss(&self, cached: &CachedJob) -> Result<(), MonitorFatal> {
        let verdict = self.misses.lock().await.record_miss(cached.job_id);
        match verdict {
            MissVerdict::Retry { misses } => {
                tracing::debug!(
                    job_id = %cached.job_id,
                    backend_job_id = %cached.backend_job_id,
                    misses,
                    "No pod found for job",
                );
                Ok(())
            }
            MissVerdict::Exhausted { first } => {
                if first {
                    tracing::warn!(
                        job_id = %cached.job_id,
                        backend_job_id = %cached.backend_job_id,
                        "No pod found for job after repeated resyncs, marking it unknown",
                    );
                }
                self.apply(cached, JobStatus::Unknown).await.map(|_| ())
            }
        }
    }

    /// Collect logs of a finished pod and delete its Job.
    async fn finalize(&self, cached: &CachedJob, pod: &Pod) -> Result<(), MonitorFatal> {
        let logs = self.collect_logs(pod).await;
        if !logs.is_empty() {
            if let Err(e) = self.writer.store().store_logs(cached.job_id, &logs).await {
                if e.is_unavailable() {
                    return Err(MonitorFatal::new(ComputeBackend::Kubernetes.as_str(), e));
                }
                tracing::warn!(job_id = %cached.job_id, error = %e, "Failed to store job logs");
            }
        }

        if let Err(e) = self.client.delete_job(&cached.backend_job_id).await {
            tracing::warn!(
                job_id = %cached.job_id,
                backend_job_id = %cached.backend_job_id,
                error = %e,
                "Failed to delete finished Kubernetes job",
            );
        }
        Ok(())
    }

    /// Logs of every container, init containers first. An image that
    /// never pulled has no logs; its waiting message stands in for them.
    async fn collect_logs(&self, pod: &Pod) -> String {
        let mut logs = String::new();
        if let Some((container, detail)) = pod.fatal_waiting() {
            logs.push_str(&format!(
                "{container}: {}: {}\n",
                detail.reason.as_deref().unwrap_or_default(),
                detail.message.as_deref().unwrap_or_default(),
            ));
        }

        let Some(pod_name) = pod.name() else {
            return logs;
        };
        for container in pod.container_statuses() {
            match self.client.read_pod_log(pod_name, &container.name).await {
                Ok(text) if !text.is_empty() => {
                    logs.push_str(&format!("{}:\n{text}\n", container.name));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        pod = pod_name,
                        container = %container.name,
                        error = %e,
                        "Failed to read container log",
                    );
                }
            }
        }
        logs
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use jobctl_core::job::{Job, JobRequest};
    use jobctl_db::{InMemoryJobStore, JobCache, JobStore};

    use super::*;
    use crate::api::DeleteOutcome;
    use crate::manifest::JobManifest;
    use crate::pod::PodList;

    #[derive(Default)]
    struct ListingClient {
        pods: Mutex<Vec<Pod>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl KubernetesClient for ListingClient {
        async fn create_job(&self, _manifest: &JobManifest) -> Result<(), KubeApiError> {
            Ok(())
        }

        async fn delete_job(&self, name: &str) -> Result<DeleteOutcome, KubeApiError> {
            self.deleted.lock().await.push(name.to_string());
            Ok(DeleteOutcome::Deleted)
        }

        async fn list_job_pods(&self) -> Result<PodList, KubeApiError> {
            Ok(PodList {
                items: self.pods.lock().await.clone(),
                ..Default::default()
            })
        }

        async fn watch_job_pods(&self, _rv: &str) -> Result<WatchStream, KubeApiError> {
            Ok(futures::stream::pending().boxed())
        }

        async fn read_pod_log(&self, _pod: &str, container: &str) -> Result<String, KubeApiError> {
            Ok(format!("output of {container}"))
        }
    }

    fn pod(job_name: &str, phase: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": format!("{job_name}-abcde"), "labels": {"job-name": job_name}},
            "status": {"phase": phase, "containerStatuses": [{"name": "job"}]}
        }))
        .unwrap()
    }

    async fn setup(budget: u32) -> (Arc<ListingClient>, Arc<InMemoryJobStore>, KubernetesMonitor, CachedJob) {
        let client = Arc::new(ListingClient::default());
        let store = Arc::new(InMemoryJobStore::new());
        let cache = JobCache::new();
        let writer = StatusWriter::new(store.clone(), cache.clone());
        let monitor = KubernetesMonitor::new(
            client.clone(),
            writer,
            MonitorConfig {
                miss_budget: budget,
                ..Default::default()
            },
        );

        let request = JobRequest::new("busybox", vec!["ls".into()], uuid::Uuid::new_v4());
        let job_id = uuid::Uuid::new_v4();
        let name = crate::manifest::job_name_for(job_id);
        let job = Job::submitted(job_id, &request, name.clone(), chrono::Utc::now());
        store.create(&job).await.unwrap();
        let cached = CachedJob {
            job_id,
            backend: ComputeBackend::Kubernetes,
            backend_job_id: name,
            workflow_id: request.workflow_id(),
            workspace: PathBuf::from("/var/reana/wf"),
            status: JobStatus::Submitted,
            cached_at: job.created_at,
        };
        cache.insert(cached.clone()).await;
        (client, store, monitor, cached)
    }

    #[tokio::test]
    async fn running_then_succeeded_collects_logs_and_deletes() {
        let (client, store, monitor, cached) = setup(3).await;

        monitor.handle_pod(&pod(&cached.backend_job_id, "Running")).await.unwrap();
        let job = store.get(cached.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(client.deleted.lock().await.is_empty());

        monitor.handle_pod(&pod(&cached.backend_job_id, "Succeeded")).await.unwrap();
        let job = store.get(cached.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.logs.as_deref(), Some("job:\noutput of job\n"));
        assert_eq!(*client.deleted.lock().await, vec![cached.backend_job_id.clone()]);

        // A replayed event does not delete twice.
        monitor.handle_pod(&pod(&cached.backend_job_id, "Succeeded")).await.unwrap();
        assert_eq!(client.deleted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn pods_of_unknown_jobs_are_ignored() {
        let (client, _store, monitor, _cached) = setup(3).await;
        monitor.handle_pod(&pod("someone-else", "Failed")).await.unwrap();
        assert!(client.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn missing_pod_becomes_unknown_after_budget() {
        let (_client, store, monitor, cached) = setup(2).await;

        monitor.resync_once().await.unwrap();
        assert_eq!(
            store.get(cached.job_id).await.unwrap().unwrap().status,
            JobStatus::Submitted
        );

        monitor.resync_once().await.unwrap();
        assert_eq!(
            store.get(cached.job_id).await.unwrap().unwrap().status,
            JobStatus::Unknown
        );
    }

    #[tokio::test]
    async fn seen_pod_resets_miss_streak() {
        let (client, store, monitor, cached) = setup(2).await;

        monitor.resync_once().await.unwrap();
        client.pods.lock().await.push(pod(&cached.backend_job_id, "Pending"));
        monitor.resync_once().await.unwrap();
        client.pods.lock().await.clear();
        monitor.resync_once().await.unwrap();

        assert_eq!(
            store.get(cached.job_id).await.unwrap().unwrap().status,
            JobStatus::Submitted
        );
    }

    #[tokio::test]
    async fn store_outage_is_fatal() {
        let (_client, store, monitor, cached) = setup(3).await;
        store.set_unavailable(true);
        let err = monitor
            .handle_pod(&pod(&cached.backend_job_id, "Running"))
            .await
            .unwrap_err();
        assert_eq!(err.backend, "kubernetes");
    }
}
