//! Domain types and pure logic for the job dispatch and monitoring
//! subsystem.
//!
//! Nothing in this crate performs I/O. Backend crates build on the
//! canonical [`status::JobStatus`] state machine, the
//! [`backend::JobBackend`] contract, and the credential/volume
//! [`injector`].

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod injector;
pub mod job;
pub mod observation;
pub mod status;
pub mod types;
