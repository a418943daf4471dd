//! Typed `batch/v1` Job manifests.
//!
//! Only the fields the controller sets are modelled. Everything
//! serializes with the API's camelCase names and omits empty fields, so
//! the JSON sent to the API server stays minimal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use jobctl_core::config::ControllerConfig;
use jobctl_core::injector::{InjectionPlan, KerberosIdentity, SidecarSpec, KRB5_CACHE_ENV};
use jobctl_core::job::{JobRequest, ResourceHints};
use jobctl_core::types::JobId;
use serde::{Deserialize, Serialize};

/// Prefix of every Kubernetes Job the controller creates.
pub const JOB_NAME_PREFIX: &str = "jobctl-run-";

/// Label the Job controller puts on every pod it creates.
pub const JOB_NAME_LABEL: &str = "job-name";

/// Labels correlating Kubernetes objects with job records.
pub const JOB_ID_LABEL: &str = "jobctl/job-id";
pub const WORKFLOW_ID_LABEL: &str = "jobctl/workflow-id";

/// Name of the user container.
pub const MAIN_CONTAINER_NAME: &str = "job";

const WORKSPACE_VOLUME: &str = "workspace";
const KRB5_CACHE_VOLUME: &str = "krb5-cache";
const KRB5_CONF_VOLUME: &str = "krb5-conf";
const KRB5_KEYTAB_VOLUME: &str = "krb5-keytab";
const KRB5_CONF_PATH: &str = "/etc/krb5.conf";
const KRB5_CONF_KEY: &str = "krb5.conf";
/// Seconds between ticket renewals in the sidecar.
const KRB5_RENEW_INTERVAL_SECS: u32 = 3600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

impl JobManifest {
    /// The Job's name, which is also the backend job id.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The user container. Always present in manifests built here.
    pub fn main_container(&self) -> Option<&Container> {
        self.spec
            .template
            .spec
            .containers
            .iter()
            .find(|c| c.name == MAIN_CONTAINER_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub backoff_limit: i32,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// `Always` on an init container makes it a native sidecar that
    /// runs alongside the main container and stops with it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    HostPath(HostPathSource),
    EmptyDir(EmptyDirSource),
    ConfigMap(ConfigMapSource),
    Secret(SecretSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPathSource {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyDirSource {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapSource {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityContext {
    pub run_as_user: i64,
}

/// Static settings shared by every manifest.
#[derive(Debug, Clone)]
pub struct ManifestSettings {
    pub namespace: String,
    pub shared_volume_root: PathBuf,
    pub runtime_user_uid: Option<i64>,
}

impl ManifestSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            namespace: config.kubernetes.namespace.clone(),
            shared_volume_root: config.shared_volume_root.clone(),
            runtime_user_uid: config.kubernetes.runtime_user_uid,
        }
    }
}

/// Kubernetes Job name for a job record.
pub fn job_name_for(job_id: JobId) -> String {
    format!("{JOB_NAME_PREFIX}{job_id}")
}

/// Build the Job manifest for one submission.
pub fn build_job_manifest(
    job_id: JobId,
    request: &JobRequest,
    plan: &InjectionPlan,
    settings: &ManifestSettings,
) -> JobManifest {
    let workflow_id = request.workflow_id();
    let workspace = request.workspace(&settings.shared_volume_root);
    let workspace_str = path_string(&workspace);

    let labels = BTreeMap::from([
        (JOB_ID_LABEL.to_string(), job_id.to_string()),
        (WORKFLOW_ID_LABEL.to_string(), workflow_id.to_string()),
    ]);

    let mut env: Vec<EnvVar> = request
        .env_vars()
        .iter()
        .map(|(name, value)| env_var(name, value))
        .collect();

    let mut volume_mounts = vec![VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: workspace_str.clone(),
        sub_path: None,
        read_only: None,
    }];
    let mut volumes = vec![Volume {
        name: WORKSPACE_VOLUME.to_string(),
        source: VolumeSource::HostPath(HostPathSource {
            path: workspace_str.clone(),
        }),
    }];

    for mount in &plan.volumes {
        volumes.push(Volume {
            name: mount.name.clone(),
            source: VolumeSource::HostPath(HostPathSource {
                path: path_string(&mount.host_path),
            }),
        });
        volume_mounts.push(VolumeMount {
            name: mount.name.clone(),
            mount_path: path_string(&mount.mount_path),
            sub_path: None,
            read_only: None,
        });
    }

    let mut init_containers = Vec::new();
    if let (Some(sidecar), Some(identity)) = (&plan.sidecar, &plan.kerberos) {
        let cache_mount = VolumeMount {
            name: KRB5_CACHE_VOLUME.to_string(),
            mount_path: path_string(&sidecar.shared_cache_path),
            sub_path: None,
            read_only: None,
        };
        volume_mounts.push(cache_mount);
        volume_mounts.push(krb5_conf_mount());
        if let Some(value) = plan.kerberos_cache_env(workflow_id, &workspace) {
            env.push(env_var(KRB5_CACHE_ENV, &value));
        }
        volumes.extend(kerberos_volumes(identity));
        init_containers.extend(kerberos_containers(sidecar, identity, request));
    }

    let main = Container {
        name: MAIN_CONTAINER_NAME.to_string(),
        image: request.docker_image().to_string(),
        command: request.command().to_vec(),
        env,
        working_dir: Some(workspace_str),
        volume_mounts,
        resources: resource_requirements(request.resources()),
        restart_policy: None,
    };

    JobManifest {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta {
            name: Some(job_name_for(job_id)),
            namespace: Some(settings.namespace.clone()),
            labels: labels.clone(),
            resource_version: None,
        },
        spec: JobSpec {
            backoff_limit: 0,
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    restart_policy: "Never".to_string(),
                    containers: vec![main],
                    init_containers,
                    volumes,
                    image_pull_secrets: plan
                        .image_pull_secrets
                        .iter()
                        .map(|name| LocalObjectReference { name: name.clone() })
                        .collect(),
                    security_context: settings
                        .runtime_user_uid
                        .map(|uid| PodSecurityContext { run_as_user: uid }),
                },
            },
        },
    }
}

// ---- private helpers ----

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

fn resource_requirements(hints: &ResourceHints) -> Option<ResourceRequirements> {
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = hints.cpu_millicores {
        quantities.insert("cpu".to_string(), format!("{cpu}m"));
    }
    if let Some(memory) = hints.memory_mb {
        quantities.insert("memory".to_string(), format!("{memory}Mi"));
    }
    if let Some(gpus) = hints.gpus {
        quantities.insert("nvidia.com/gpu".to_string(), gpus.to_string());
    }
    if quantities.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: quantities.clone(),
        limits: quantities,
    })
}

fn kerberos_volumes(identity: &KerberosIdentity) -> [Volume; 3] {
    [
        Volume {
            name: KRB5_CACHE_VOLUME.to_string(),
            source: VolumeSource::EmptyDir(EmptyDirSource::default()),
        },
        Volume {
            name: KRB5_CONF_VOLUME.to_string(),
            source: VolumeSource::ConfigMap(ConfigMapSource {
                name: identity.configmap_name.clone(),
            }),
        },
        Volume {
            name: KRB5_KEYTAB_VOLUME.to_string(),
            source: VolumeSource::Secret(SecretSource {
                secret_name: identity.keytab_secret.clone(),
            }),
        },
    ]
}

/// Realm configuration, read-only at the standard location.
fn krb5_conf_mount() -> VolumeMount {
    VolumeMount {
        name: KRB5_CONF_VOLUME.to_string(),
        mount_path: KRB5_CONF_PATH.to_string(),
        sub_path: Some(KRB5_CONF_KEY.to_string()),
        read_only: Some(true),
    }
}

/// `<name>-init` obtains the first ticket before the job starts;
/// `<name>-renew` keeps renewing it for as long as the job runs.
fn kerberos_containers(
    sidecar: &SidecarSpec,
    identity: &KerberosIdentity,
    request: &JobRequest,
) -> [Container; 2] {
    let cache = format!(
        "FILE:{}",
        sidecar.cache_file_path(request.workflow_id()).display()
    );
    let keytab = path_string(&identity.keytab_path);
    let keytab_dir = identity
        .keytab_path
        .parent()
        .map(path_string)
        .unwrap_or_else(|| "/".to_string());

    let mounts = vec![
        VolumeMount {
            name: KRB5_CACHE_VOLUME.to_string(),
            mount_path: path_string(&sidecar.shared_cache_path),
            sub_path: None,
            read_only: None,
        },
        krb5_conf_mount(),
        VolumeMount {
            name: KRB5_KEYTAB_VOLUME.to_string(),
            mount_path: keytab_dir,
            sub_path: None,
            read_only: Some(true),
        },
    ];
    let env = vec![env_var(KRB5_CACHE_ENV, &cache)];

    let init = Container {
        name: format!("{}-init", sidecar.container_name),
        image: sidecar.image_ref.clone(),
        command: vec![
            "kinit".to_string(),
            "-kt".to_string(),
            keytab.clone(),
            "-c".to_string(),
            cache.clone(),
            identity.principal.clone(),
        ],
        env: env.clone(),
        working_dir: None,
        volume_mounts: mounts.clone(),
        resources: None,
        restart_policy: None,
    };

    let renew_script = format!(
        "while true; do sleep {KRB5_RENEW_INTERVAL_SECS}; \
         kinit -R -c {cache} || kinit -kt {keytab} -c {cache} {principal}; done",
        principal = identity.principal,
    );
    let renew = Container {
        name: format!("{}-renew", sidecar.container_name),
        image: sidecar.image_ref.clone(),
        command: vec!["sh".to_string(), "-c".to_string(), renew_script],
        env,
        working_dir: None,
        volume_mounts: mounts,
        resources: None,
        restart_policy: Some("Always".to_string()),
    };

    [init, renew]
}

#[cfg(test)]
mod tests {
    use jobctl_core::backend::ComputeBackend;
    use jobctl_core::config::InjectionConfig;
    use jobctl_core::injector::{is_reserved_volume_name, plan_injection, VolumeMountSpec};
    use uuid::Uuid;

    use super::*;

    fn settings() -> ManifestSettings {
        ManifestSettings {
            namespace: "reana".into(),
            shared_volume_root: PathBuf::from("/var/reana"),
            runtime_user_uid: None,
        }
    }

    fn plan(config: &InjectionConfig, request: &JobRequest) -> InjectionPlan {
        plan_injection(
            config,
            ComputeBackend::Kubernetes,
            request.workflow_id(),
            request.requires_kerberos(),
        )
        .unwrap()
    }

    #[test]
    fn busybox_manifest_carries_image_command_and_env() {
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4())
            .with_env_var("FOO", "bar");
        let job_id = Uuid::new_v4();
        let manifest = build_job_manifest(
            job_id,
            &request,
            &plan(&InjectionConfig::default(), &request),
            &settings(),
        );

        let body = serde_json::to_value(&manifest).unwrap();
        let container = &body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "busybox");
        assert_eq!(container["command"], serde_json::json!(["ls"]));
        assert_eq!(container["env"].as_array().unwrap().len(), 1);
        assert_eq!(container["env"][0], serde_json::json!({"name": "FOO", "value": "bar"}));

        assert_eq!(body["apiVersion"], "batch/v1");
        assert_eq!(body["kind"], "Job");
        assert_eq!(body["metadata"]["name"], job_name_for(job_id));
        assert_eq!(body["metadata"]["namespace"], "reana");
        assert_eq!(body["spec"]["backoffLimit"], 0);
        assert_eq!(body["spec"]["template"]["spec"]["restartPolicy"], "Never");
        assert!(body["spec"]["template"]["spec"].get("initContainers").is_none());

        let parsed: JobManifest = serde_json::from_value(body).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn workspace_is_mounted_and_used_as_working_dir() {
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4());
        let manifest = build_job_manifest(
            Uuid::new_v4(),
            &request,
            &plan(&InjectionConfig::default(), &request),
            &settings(),
        );
        let expected = format!("/var/reana/{}", request.workflow_id());
        let main = manifest.main_container().unwrap();
        assert_eq!(main.working_dir.as_deref(), Some(expected.as_str()));
        assert_eq!(main.volume_mounts[0].mount_path, expected);
        assert_eq!(
            manifest.spec.template.spec.volumes[0].source,
            VolumeSource::HostPath(HostPathSource { path: expected })
        );
    }

    #[test]
    fn kerberos_adds_init_and_renew_containers_sharing_the_cache() {
        let config = InjectionConfig {
            krb5_principal: Some("reana@CERN.CH".into()),
            ..Default::default()
        };
        let request =
            JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4()).with_kerberos(true);
        let manifest =
            build_job_manifest(Uuid::new_v4(), &request, &plan(&config, &request), &settings());
        let pod = &manifest.spec.template.spec;

        let names: Vec<&str> = pod.init_containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["krb5-init", "krb5-renew"]);
        assert_eq!(pod.init_containers[0].restart_policy, None);
        assert_eq!(pod.init_containers[1].restart_policy.as_deref(), Some("Always"));
        assert_eq!(pod.init_containers[0].image, "reanahub/krb5:latest");

        let main = manifest.main_container().unwrap();
        let ccname = main.env.iter().find(|e| e.name == KRB5_CACHE_ENV).unwrap();
        assert_eq!(
            ccname.value,
            format!("FILE:/krb5_cache/krb5_{}", request.workflow_id())
        );
        for container in pod.init_containers.iter().chain(pod.containers.iter()) {
            assert!(
                container
                    .volume_mounts
                    .iter()
                    .any(|m| m.name == KRB5_CACHE_VOLUME),
                "{} lacks the cache mount",
                container.name
            );
        }
        assert!(pod
            .volumes
            .iter()
            .any(|v| v.name == KRB5_CACHE_VOLUME && v.source == VolumeSource::EmptyDir(EmptyDirSource {})));

        let conf = main
            .volume_mounts
            .iter()
            .find(|m| m.name == KRB5_CONF_VOLUME)
            .unwrap();
        assert_eq!(conf.mount_path, "/etc/krb5.conf");
        assert_eq!(conf.sub_path.as_deref(), Some("krb5.conf"));
        assert_eq!(conf.read_only, Some(true));
    }

    #[test]
    fn builtin_volume_names_are_reserved() {
        for name in [WORKSPACE_VOLUME, KRB5_CACHE_VOLUME, KRB5_CONF_VOLUME, KRB5_KEYTAB_VOLUME] {
            assert!(is_reserved_volume_name(name), "{name}");
        }
    }

    #[test]
    fn hostpath_mounts_and_pull_secrets_are_attached() {
        let config = InjectionConfig {
            image_pull_secrets: vec!["gitlab-registry".into()],
            hostpath_mounts: vec![VolumeMountSpec {
                name: "cvmfs".into(),
                host_path: "/cvmfs".into(),
                mount_path: "/cvmfs".into(),
            }],
            ..Default::default()
        };
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4());
        let manifest =
            build_job_manifest(Uuid::new_v4(), &request, &plan(&config, &request), &settings());
        let pod = &manifest.spec.template.spec;

        assert_eq!(
            pod.image_pull_secrets,
            vec![LocalObjectReference {
                name: "gitlab-registry".into()
            }]
        );
        assert!(pod.volumes.iter().any(|v| v.name == "cvmfs"));
        let main = manifest.main_container().unwrap();
        assert!(main.volume_mounts.iter().any(|m| m.mount_path == "/cvmfs"));
    }

    #[test]
    fn resources_become_requests_and_limits() {
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4()).with_resources(
            ResourceHints {
                cpu_millicores: Some(500),
                memory_mb: Some(2048),
                gpus: Some(1),
            },
        );
        let manifest = build_job_manifest(
            Uuid::new_v4(),
            &request,
            &plan(&InjectionConfig::default(), &request),
            &settings(),
        );
        let resources = manifest.main_container().unwrap().resources.clone().unwrap();
        assert_eq!(resources.requests["cpu"], "500m");
        assert_eq!(resources.limits["memory"], "2048Mi");
        assert_eq!(resources.limits["nvidia.com/gpu"], "1");
    }

    #[test]
    fn runtime_uid_sets_security_context() {
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4());
        let manifest = build_job_manifest(
            Uuid::new_v4(),
            &request,
            &plan(&InjectionConfig::default(), &request),
            &ManifestSettings {
                runtime_user_uid: Some(1000),
                ..settings()
            },
        );
        let body = serde_json::to_value(&manifest).unwrap();
        assert_eq!(body["spec"]["template"]["spec"]["securityContext"]["runAsUser"], 1000);
    }
}
