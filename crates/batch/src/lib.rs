//! HPC batch backends: HTCondor and Slurm.
//!
//! Both submit through their command-line clients, run either locally
//! or on a head node over `ssh` (see [`command`]), and are observed by
//! the shared [`monitor::PollingMonitor`].

pub mod command;
pub mod htcondor;
pub mod monitor;
pub mod slurm;
pub mod staging;

pub use command::{runner_for, CommandRunner, LocalRunner, SshRunner};
pub use htcondor::HtCondorBackend;
pub use monitor::{BatchProbe, PollingMonitor};
pub use slurm::SlurmBackend;
