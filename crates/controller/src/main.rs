use std::sync::Arc;

use anyhow::Context;
use jobctl_core::config::ControllerConfig;
use jobctl_db::{JobCache, JobStore, PgJobStore};
use jobctl_dispatch::{BackendRegistry, MonitorSupervisor};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobctl_controller=debug,jobctl_dispatch=debug,jobctl_kubernetes=info,jobctl_batch=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = Arc::new(ControllerConfig::from_env().context("Invalid controller configuration")?);
    tracing::info!(
        backends = ?config.enabled_backends,
        default_backend = %config.default_backend,
        shared_volume_root = %config.shared_volume_root.display(),
        "Loaded controller configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = jobctl_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    jobctl_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    jobctl_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    // --- Outstanding jobs from a previous run ---
    let cache = JobCache::new();
    for &backend in &config.enabled_backends {
        let loaded = cache
            .resync_from_store(store.as_ref(), backend, &config.shared_volume_root)
            .await
            .with_context(|| format!("Failed to load active {backend} jobs"))?;
        tracing::info!(backend = %backend, count = loaded, "Outstanding jobs loaded");
    }

    // --- Backends and monitors ---
    let registry = BackendRegistry::from_config(config.clone(), store, cache)
        .await
        .context("Failed to set up compute backends")?;

    let process = CancellationToken::new();
    let supervisor = MonitorSupervisor::start(registry.monitors(), process.clone());

    tokio::select! {
        () = shutdown_signal() => {}
        () = process.cancelled() => {
            tracing::error!("A monitor failed, shutting down");
        }
    }
    process.cancel();

    if let Some(fatal) = supervisor.shutdown().await {
        anyhow::bail!(fatal);
    }
    tracing::info!("Controller stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
