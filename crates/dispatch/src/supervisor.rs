//! Monitor supervision.
//!
//! [`MonitorSupervisor`] spawns one task per backend monitor, each with a
//! child of the process cancellation token. A monitor that returns
//! [`MonitorFatal`] cancels the process token so the binary can exit
//! instead of running on without an observer.

use std::sync::Arc;
use std::time::Duration;

use jobctl_core::backend::ComputeBackend;
use jobctl_core::error::MonitorFatal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::BackendMonitor;

/// How long `shutdown` waits for each monitor task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MonitorSupervisor {
    tasks: Vec<SupervisedMonitor>,
    fatal: Arc<Mutex<Option<MonitorFatal>>>,
}

struct SupervisedMonitor {
    backend: ComputeBackend,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl MonitorSupervisor {
    /// Spawn every monitor. `process` is cancelled on the first fatal
    /// monitor error.
    pub fn start(monitors: Vec<(ComputeBackend, BackendMonitor)>, process: CancellationToken) -> Self {
        let fatal = Arc::new(Mutex::new(None));
        let tasks = monitors
            .into_iter()
            .map(|(backend, monitor)| {
                let cancel = process.child_token();
                let handle = tokio::spawn(supervise(
                    backend,
                    monitor,
                    cancel.clone(),
                    process.clone(),
                    fatal.clone(),
                ));
                SupervisedMonitor {
                    backend,
                    handle,
                    cancel,
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(count = tasks.len(), "Monitors started");
        Self { tasks, fatal }
    }

    /// The first fatal monitor error, if any occurred.
    pub async fn fatal(&self) -> Option<MonitorFatal> {
        self.fatal.lock().await.clone()
    }

    /// Stop every monitor, waiting up to 5 seconds per task. Returns the
    /// fatal error that ended supervision early, if any.
    pub async fn shutdown(self) -> Option<MonitorFatal> {
        tracing::info!("Shutting down monitors");
        for task in self.tasks {
            task.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await.is_err() {
                tracing::warn!(backend = %task.backend, "Monitor did not stop in time");
            }
        }
        let fatal = self.fatal.lock().await.take();
        tracing::info!("Monitor shutdown complete");
        fatal
    }
}

// ---- private helpers ----

async fn supervise(
    backend: ComputeBackend,
    monitor: BackendMonitor,
    cancel: CancellationToken,
    process: CancellationToken,
    fatal: Arc<Mutex<Option<MonitorFatal>>>,
) {
    match monitor.run(cancel).await {
        Ok(()) => tracing::info!(backend = %backend, "Monitor exited"),
        Err(e) => {
            tracing::error!(backend = %backend, error = %e, "Monitor failed, stopping controller");
            fatal.lock().await.get_or_insert(e);
            process.cancel();
        }
    }
}
