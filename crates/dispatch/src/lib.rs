//! Job dispatch: the hook-wrapped job manager, the backend registry,
//! and supervision of the per-backend monitors.

pub mod hooks;
pub mod manager;
pub mod registry;
pub mod supervisor;

pub use hooks::{execute_with_hooks, ExecutionHooks, Prepared};
pub use manager::JobManager;
pub use registry::{BackendEntry, BackendMonitor, BackendRegistry};
pub use supervisor::MonitorSupervisor;
