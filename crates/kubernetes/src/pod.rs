//! Read-only views of pods and watch events, and the mapping from pod
//! phase to canonical status.

use jobctl_core::status::JobStatus;
use serde::Deserialize;

use crate::manifest::{ObjectMeta, JOB_NAME_LABEL};

/// Waiting reasons that mean the pod will never start.
pub const FATAL_WAITING_REASONS: [&str; 3] = ["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: Option<ContainerState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub waiting: Option<ContainerStateDetail>,
    #[serde(default)]
    pub terminated: Option<ContainerStateDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateDetail {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Pod>,
}

/// `Status` object carried by watch `ERROR` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One line of a pod watch stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    Bookmark(Pod),
    Error(ApiStatus),
}

impl Pod {
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    /// Name of the owning Kubernetes Job, i.e. the backend job id.
    pub fn job_name(&self) -> Option<&str> {
        self.metadata.labels.get(JOB_NAME_LABEL).map(String::as_str)
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }

    /// Init containers first, then regular containers.
    pub fn container_statuses(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.status.iter().flat_map(|s| {
            s.init_container_statuses
                .iter()
                .chain(s.container_statuses.iter())
        })
    }

    /// First container stuck on a waiting reason it cannot recover from.
    pub fn fatal_waiting(&self) -> Option<(&str, &ContainerStateDetail)> {
        self.container_statuses().find_map(|c| {
            let waiting = c.state.as_ref()?.waiting.as_ref()?;
            let reason = waiting.reason.as_deref()?;
            FATAL_WAITING_REASONS
                .contains(&reason)
                .then_some((c.name.as_str(), waiting))
        })
    }
}

/// Canonical status for a pod, or `None` when the pod says nothing new
/// (still pending, or no phase reported yet).
pub fn canonical_status(pod: &Pod) -> Option<JobStatus> {
    match pod.phase()? {
        "Pending" => pod.fatal_waiting().map(|_| JobStatus::Failed),
        "Running" => Some(JobStatus::Running),
        "Succeeded" => Some(JobStatus::Succeeded),
        "Failed" => Some(JobStatus::Failed),
        "Unknown" => Some(JobStatus::Unknown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(json: serde_json::Value) -> Pod {
        serde_json::from_value(json).unwrap()
    }

    fn with_phase(phase: &str) -> Pod {
        pod(serde_json::json!({
            "metadata": {"name": "p", "labels": {"job-name": "jobctl-run-1"}},
            "status": {"phase": phase}
        }))
    }

    #[test]
    fn phases_map_to_canonical_statuses() {
        assert_eq!(canonical_status(&with_phase("Pending")), None);
        assert_eq!(canonical_status(&with_phase("Running")), Some(JobStatus::Running));
        assert_eq!(canonical_status(&with_phase("Succeeded")), Some(JobStatus::Succeeded));
        assert_eq!(canonical_status(&with_phase("Failed")), Some(JobStatus::Failed));
        assert_eq!(canonical_status(&with_phase("Unknown")), Some(JobStatus::Unknown));
        assert_eq!(canonical_status(&Pod::default()), None);
    }

    #[test]
    fn image_pull_failure_while_pending_is_failed() {
        for reason in FATAL_WAITING_REASONS {
            let p = pod(serde_json::json!({
                "metadata": {"name": "p"},
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [{
                        "name": "job",
                        "state": {"waiting": {"reason": reason, "message": "pull failed"}}
                    }]
                }
            }));
            assert_eq!(canonical_status(&p), Some(JobStatus::Failed), "{reason}");
            let (container, detail) = p.fatal_waiting().unwrap();
            assert_eq!(container, "job");
            assert_eq!(detail.message.as_deref(), Some("pull failed"));
        }
    }

    #[test]
    fn container_creating_stays_pending() {
        let p = pod(serde_json::json!({
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "name": "job",
                    "state": {"waiting": {"reason": "ContainerCreating"}}
                }]
            }
        }));
        assert_eq!(canonical_status(&p), None);
    }

    #[test]
    fn job_name_comes_from_label() {
        assert_eq!(with_phase("Running").job_name(), Some("jobctl-run-1"));
        assert_eq!(Pod::default().job_name(), None);
    }

    #[test]
    fn init_containers_come_first() {
        let p = pod(serde_json::json!({
            "status": {
                "phase": "Running",
                "initContainerStatuses": [{"name": "krb5-init"}],
                "containerStatuses": [{"name": "job"}]
            }
        }));
        let names: Vec<&str> = p.container_statuses().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["krb5-init", "job"]);
    }

    #[test]
    fn watch_events_decode() {
        let added: WatchEvent = serde_json::from_str(
            r#"{"type":"ADDED","object":{"metadata":{"name":"p","resourceVersion":"12"}}}"#,
        )
        .unwrap();
        match added {
            WatchEvent::Added(p) => assert_eq!(p.resource_version(), Some("12")),
            other => panic!("unexpected {other:?}"),
        }

        let gone: WatchEvent = serde_json::from_str(
            r#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired"}}"#,
        )
        .unwrap();
        assert_eq!(
            gone,
            WatchEvent::Error(ApiStatus {
                code: Some(410),
                reason: Some("Expired".into()),
                message: None,
            })
        );
    }
}
