//! Repository layer for the `jobs` table.

pub mod job_repo;

pub use job_repo::{JobRepo, PgJobStore};
