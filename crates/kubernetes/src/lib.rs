//! Kubernetes compute backend.
//!
//! - [`backend::KubernetesBackend`]: turns a job request into a
//!   `batch/v1` Job and deletes it on stop.
//! - [`monitor::KubernetesMonitor`]: watches the job pods and maps pod
//!   phases onto canonical statuses.
//! - [`api::KubernetesClient`]: the narrow slice of the Kubernetes REST
//!   API both of them need, with a `reqwest` implementation.

pub mod api;
pub mod backend;
pub mod manifest;
pub mod monitor;
pub mod pod;

pub use api::{KubeApiError, KubernetesApi, KubernetesClient};
pub use backend::KubernetesBackend;
pub use monitor::KubernetesMonitor;
