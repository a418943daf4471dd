//! Backend registry.
//!
//! Built once at startup from [`ControllerConfig`]: one entry per
//! enabled backend, each pairing a [`JobManager`] with the monitor that
//! observes its jobs. Lookups for unknown or disabled backends fail with
//! [`SubmissionError::BackendNotEnabled`] before any backend is touched.

use std::sync::Arc;

use jobctl_batch::staging::BatchSettings;
use jobctl_batch::{runner_for, HtCondorBackend, PollingMonitor, SlurmBackend};
use jobctl_core::backend::{ComputeBackend, JobBackend, StopOutcome};
use jobctl_core::config::ControllerConfig;
use jobctl_core::error::{CoreError, MonitorFatal, StopError, SubmissionError};
use jobctl_core::job::{Job, JobRequest};
use jobctl_core::types::JobId;
use jobctl_db::{JobCache, JobStore, StatusWriter};
use jobctl_kubernetes::manifest::ManifestSettings;
use jobctl_kubernetes::{KubernetesApi, KubernetesBackend, KubernetesMonitor};
use tokio_util::sync::CancellationToken;

use crate::manager::JobManager;

/// Timeout for one HTCondor/Slurm client invocation.
const BATCH_COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// The monitor observing one backend.
#[derive(Clone)]
pub enum BackendMonitor {
    Kubernetes(Arc<KubernetesMonitor>),
    Batch(Arc<PollingMonitor>),
}

impl BackendMonitor {
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), MonitorFatal> {
        match self {
            Self::Kubernetes(monitor) => monitor.run(cancel).await,
            Self::Batch(monitor) => monitor.run(cancel).await,
        }
    }
}

/// One enabled backend.
pub struct BackendEntry {
    pub backend: ComputeBackend,
    pub manager: Arc<JobManager>,
    pub monitor: BackendMonitor,
}

pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
    default_backend: ComputeBackend,
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("entries", &self.entries)
            .field("default_backend", &self.default_backend)
            .finish_non_exhaustive()
    }
}

impl BackendRegistry {
    /// Assemble a registry from prepared entries.
    pub fn new(
        entries: Vec<BackendEntry>,
        default_backend: ComputeBackend,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, CoreError> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.backend == entry.backend) {
                return Err(CoreError::Configuration(format!(
                    "Compute backend '{}' registered twice",
                    entry.backend
                )));
            }
        }
        if !entries.iter().any(|e| e.backend == default_backend) {
            return Err(CoreError::Configuration(format!(
                "Default compute backend '{default_backend}' is not enabled"
            )));
        }
        Ok(Self {
            entries,
            default_backend,
            store,
        })
    }

    /// Build clients, managers, and monitors for every enabled backend.
    pub async fn from_config(
        config: Arc<ControllerConfig>,
        store: Arc<dyn JobStore>,
        cache: JobCache,
    ) -> Result<Self, CoreError> {
        let writer = StatusWriter::new(store.clone(), cache);
        let mut entries = Vec::with_capacity(config.enabled_backends.len());

        for &backend in &config.enabled_backends {
            let (job_backend, monitor): (Arc<dyn JobBackend>, BackendMonitor) = match backend {
                ComputeBackend::Kubernetes => {
                    let client = Arc::new(
                        KubernetesApi::from_config(&config.kubernetes)
                            .await
                            .map_err(|e| CoreError::Configuration(e.to_string()))?,
                    );
                    let job_backend = Arc::new(KubernetesBackend::new(
                        client.clone(),
                        ManifestSettings::from_config(&config),
                    ));
                    let monitor =
                        KubernetesMonitor::new(client, writer.clone(), config.monitor.clone());
                    (job_backend as Arc<dyn JobBackend>, BackendMonitor::Kubernetes(Arc::new(monitor)))
                }
                ComputeBackend::HtCondor => {
                    let runner =
                        runner_for(config.htcondor.schedd_host.as_ref(), BATCH_COMMAND_TIMEOUT);
                    let condor = Arc::new(HtCondorBackend::new(
                        runner,
                        BatchSettings::from_config(&config),
                    ));
                    let monitor =
                        PollingMonitor::new(condor.clone(), writer.clone(), config.monitor.clone());
                    (condor as Arc<dyn JobBackend>, BackendMonitor::Batch(Arc::new(monitor)))
                }
                ComputeBackend::Slurm => {
                    let runner =
                        runner_for(config.slurm.headnode.as_ref(), BATCH_COMMAND_TIMEOUT);
                    let slurm = Arc::new(SlurmBackend::new(
                        runner,
                        BatchSettings::from_config(&config),
                        &config.slurm,
                    ));
                    let monitor =
                        PollingMonitor::new(slurm.clone(), writer.clone(), config.monitor.clone());
                    (slurm as Arc<dyn JobBackend>, BackendMonitor::Batch(Arc::new(monitor)))
                }
            };

            let manager = JobManager::new(job_backend, config.clone(), writer.clone());
            entries.push(BackendEntry {
                backend,
                manager: Arc::new(manager),
                monitor,
            });
            tracing::info!(backend = %backend, "Compute backend enabled");
        }

        Self::new(entries, config.default_backend, store)
    }

    pub fn default_backend(&self) -> ComputeBackend {
        self.default_backend
    }

    pub fn backends(&self) -> impl Iterator<Item = ComputeBackend> + '_ {
        self.entries.iter().map(|e| e.backend)
    }

    pub fn get(&self, backend: ComputeBackend) -> Result<&BackendEntry, SubmissionError> {
        self.entries
            .iter()
            .find(|e| e.backend == backend)
            .ok_or_else(|| SubmissionError::BackendNotEnabled(backend.to_string()))
    }

    /// Lookup by configuration name, e.g. `slurmcern`.
    pub fn by_name(&self, name: &str) -> Result<&BackendEntry, SubmissionError> {
        let backend = ComputeBackend::from_str(name)
            .map_err(|_| SubmissionError::BackendNotEnabled(name.to_string()))?;
        self.get(backend)
    }

    /// Monitors of every enabled backend, for the supervisor.
    pub fn monitors(&self) -> Vec<(ComputeBackend, BackendMonitor)> {
        self.entries
            .iter()
            .map(|e| (e.backend, e.monitor.clone()))
            .collect()
    }

    /// Route a request to its backend's manager.
    pub async fn execute(&self, request: &JobRequest) -> Result<Job, SubmissionError> {
        self.get(request.backend())?.manager.execute(request).await
    }

    /// Cancel a job on whichever backend runs it.
    pub async fn stop(&self, job_id: JobId) -> Result<StopOutcome, StopError> {
        let job = self
            .store
            .get(job_id)
            .await
            .map_err(|e| StopError::Persistence(e.to_string()))?
            .ok_or(StopError::JobNotFound(job_id))?;
        let entry = self.get(job.backend).map_err(|e| StopError::Rejected(e.to_string()))?;
        entry.manager.stop(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use jobctl_batch::monitor::BatchProbe;
    use jobctl_core::config::MonitorConfig;
    use jobctl_core::error::ObservationError;
    use jobctl_core::injector::InjectionPlan;
    use jobctl_core::status::JobStatus;
    use jobctl_db::{CachedJob, InMemoryJobStore};
    use uuid::Uuid;

    use super::*;

    /// Slurm stand-in counting every backend call.
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobBackend for CountingBackend {
        fn kind(&self) -> ComputeBackend {
            ComputeBackend::Slurm
        }

        async fn prepare(
            &self,
            _request: &JobRequest,
            _plan: &InjectionPlan,
        ) -> Result<(), SubmissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn submit(
            &self,
            _job_id: JobId,
            _request: &JobRequest,
            _plan: &InjectionPlan,
        ) -> Result<String, SubmissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("1".into())
        }

        async fn stop(&self, _backend_job_id: &str) -> Result<StopOutcome, StopError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StopOutcome::Stopped)
        }
    }

    #[async_trait]
    impl BatchProbe for CountingBackend {
        fn backend(&self) -> ComputeBackend {
            ComputeBackend::Slurm
        }

        async fn query(
            &self,
            _jobs: &[CachedJob],
        ) -> Result<std::collections::HashMap<String, Option<JobStatus>>, ObservationError>
        {
            Ok(Default::default())
        }

        async fn side_channel(
            &self,
            _job: &CachedJob,
        ) -> Result<Option<JobStatus>, ObservationError> {
            Ok(None)
        }

        async fn collect_logs(&self, _job: &CachedJob) -> Option<String> {
            None
        }
    }

    fn slurm_only() -> (Arc<CountingBackend>, BackendRegistry) {
        let config = Arc::new(
            ControllerConfig::from_lookup(|key| match key {
                "COMPUTE_BACKENDS" | "DEFAULT_COMPUTE_BACKEND" => Some("slurmcern".into()),
                _ => None,
            })
            .unwrap(),
        );
        let store = Arc::new(InMemoryJobStore::new());
        let writer = StatusWriter::new(store.clone(), JobCache::new());
        let backend = Arc::new(CountingBackend::default());
        let monitor = PollingMonitor::new(backend.clone(), writer.clone(), MonitorConfig::default());
        let entry = BackendEntry {
            backend: ComputeBackend::Slurm,
            manager: Arc::new(JobManager::new(backend.clone(), config, writer)),
            monitor: BackendMonitor::Batch(Arc::new(monitor)),
        };
        let registry = BackendRegistry::new(vec![entry], ComputeBackend::Slurm, store).unwrap();
        (backend, registry)
    }

    #[tokio::test]
    async fn disabled_backend_is_rejected_without_backend_call() {
        let (backend, registry) = slurm_only();
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4())
            .with_backend(ComputeBackend::Kubernetes);

        assert_matches!(
            registry.execute(&request).await,
            Err(SubmissionError::BackendNotEnabled(name)) if name == "kubernetes"
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn routes_enabled_backend() {
        let (backend, registry) = slurm_only();
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4())
            .with_backend(ComputeBackend::Slurm);

        let job = registry.execute(&request).await.unwrap();
        assert_eq!(job.backend, ComputeBackend::Slurm);
        assert_eq!(registry.stop(job.id).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(registry.stop(job.id).await.unwrap(), StopOutcome::AlreadyTerminal);
        // prepare, submit, stop
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn lookup_by_name() {
        let (_backend, registry) = slurm_only();
        assert!(registry.by_name("slurmcern").is_ok());
        assert_matches!(
            registry.by_name("htcondorcern"),
            Err(SubmissionError::BackendNotEnabled(_))
        );
        assert_matches!(
            registry.by_name("lsf"),
            Err(SubmissionError::BackendNotEnabled(name)) if name == "lsf"
        );
        assert_eq!(registry.backends().collect::<Vec<_>>(), [ComputeBackend::Slurm]);
        assert_eq!(registry.monitors().len(), 1);
    }

    #[test]
    fn default_backend_must_be_registered() {
        let store = Arc::new(InMemoryJobStore::new());
        assert_matches!(
            BackendRegistry::new(vec![], ComputeBackend::Kubernetes, store),
            Err(CoreError::Configuration(_))
        );
    }
}
