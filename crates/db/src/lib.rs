//! Job Record Store access for the dispatch and monitoring subsystem.
//!
//! - [`store::JobStore`]: the store interface the subsystem consumes.
//! - [`repositories::PgJobStore`]: PostgreSQL implementation.
//! - [`memory::InMemoryJobStore`]: process-local implementation.
//! - [`cache::JobCache`]: outstanding jobs the monitors observe.
//! - [`status_writer::StatusWriter`]: the only path for status changes;
//!   enforces the canonical state machine with conditional updates.

use sqlx::postgres::PgPoolOptions;

pub mod cache;
pub mod memory;
pub mod repositories;
pub mod status_writer;
pub mod store;

pub use cache::{CachedJob, JobCache};
pub use memory::InMemoryJobStore;
pub use repositories::PgJobStore;
pub use status_writer::{StatusWriter, TransitionOutcome};
pub use store::{JobStore, StoreError, UpdateOutcome};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to make sure the database answers.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `crates/db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
