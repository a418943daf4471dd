//! Controller configuration loaded once at startup.
//!
//! The loaded [`ControllerConfig`] is immutable and shared behind an
//! `Arc`; nothing reads environment variables after startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::ComputeBackend;
use crate::error::CoreError;
use crate::injector::VolumeMountSpec;

/// Kerberos, host-path, and pull-secret settings consumed by the
/// credential/volume injector.
#[derive(Debug, Clone)]
pub struct InjectionConfig {
    /// Image of the Kerberos init/renew containers.
    pub krb5_container_image: String,
    /// Base name of the Kerberos sidecar container.
    pub krb5_container_name: String,
    /// Directory of the ticket cache shared between job and sidecar.
    /// Must match `default_ccache_name` in krb5.conf.
    pub krb5_token_cache_location: PathBuf,
    /// Ticket cache filename template; `{}` is replaced with the workflow id.
    pub krb5_token_cache_filename: String,
    /// ConfigMap holding krb5.conf.
    pub krb5_configmap_name: String,
    /// Secret holding the keytab (Kubernetes).
    pub krb5_keytab_secret: String,
    /// Keytab location inside containers and on the batch submit host.
    pub krb5_keytab_path: PathBuf,
    /// Principal used by `kinit`.
    pub krb5_principal: Option<String>,
    /// Image pull secrets attached to every job.
    pub image_pull_secrets: Vec<String>,
    /// Directory holding one docker config directory per pull secret
    /// (batch backends).
    pub image_pull_secrets_dir: PathBuf,
    /// Host paths exposed to every job.
    pub hostpath_mounts: Vec<VolumeMountSpec>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            krb5_container_image: "reanahub/krb5:latest".into(),
            krb5_container_name: "krb5".into(),
            krb5_token_cache_location: PathBuf::from("/krb5_cache/"),
            krb5_token_cache_filename: "krb5_{}".into(),
            krb5_configmap_name: "reana-krb5-conf".into(),
            krb5_keytab_secret: "reana-krb5-keytab".into(),
            krb5_keytab_path: PathBuf::from("/etc/reana/secrets/.keytab"),
            krb5_principal: None,
            image_pull_secrets: Vec::new(),
            image_pull_secrets_dir: PathBuf::from("/etc/reana/pull-secrets"),
            hostpath_mounts: Vec::new(),
        }
    }
}

/// Kubernetes API access.
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    pub api_url: String,
    pub namespace: String,
    pub token_path: PathBuf,
    pub ca_path: Option<PathBuf>,
    /// UID the job containers run as, if set.
    pub runtime_user_uid: Option<i64>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".into(),
            namespace: "default".into(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_path: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            )),
            runtime_user_uid: None,
        }
    }
}

/// Where batch commands run: locally, or over SSH on a head node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub hostname: String,
    pub port: u16,
}

/// Slurm submission settings.
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    pub partition: String,
    pub headnode: Option<RemoteHost>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: "inf-short".into(),
            headnode: None,
        }
    }
}

/// HTCondor submission settings.
#[derive(Debug, Clone, Default)]
pub struct HtCondorConfig {
    pub schedd_host: Option<RemoteHost>,
}

/// Monitor timing and retry budget.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between batch status polls.
    pub poll_interval: Duration,
    /// Interval between full Kubernetes resyncs.
    pub resync_interval: Duration,
    /// Consecutive failed observations of one job before it becomes UNKNOWN.
    pub miss_budget: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            resync_interval: Duration::from_secs(60),
            miss_budget: 3,
        }
    }
}

/// Process-wide controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root path of the shared volume holding workflow workspaces.
    pub shared_volume_root: PathBuf,
    /// Enabled backends, in configuration order, without duplicates.
    pub enabled_backends: Vec<ComputeBackend>,
    /// Backend used when a caller does not pick one.
    pub default_backend: ComputeBackend,
    pub injection: InjectionConfig,
    pub kubernetes: KubernetesConfig,
    pub slurm: SlurmConfig,
    pub htcondor: HtCondorConfig,
    pub monitor: MonitorConfig,
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                          |
    /// |------------------------------|----------------------------------|
    /// | `SHARED_VOLUME_PATH_ROOT`    | `/var/reana`                     |
    /// | `COMPUTE_BACKENDS`           | `kubernetes`                     |
    /// | `DEFAULT_COMPUTE_BACKEND`    | `kubernetes`                     |
    /// | `KRB5_CONTAINER_IMAGE`       | `reanahub/krb5:latest`           |
    /// | `KRB5_TOKEN_CACHE_LOCATION`  | `/krb5_cache/`                   |
    /// | `KRB5_TOKEN_CACHE_FILENAME`  | `krb5_{}`                        |
    /// | `KRB5_CONFIGMAP_NAME`        | `reana-krb5-conf`                |
    /// | `KRB5_KEYTAB_SECRET`         | `reana-krb5-keytab`              |
    /// | `KRB5_KEYTAB_PATH`           | `/etc/reana/secrets/.keytab`     |
    /// | `KRB5_PRINCIPAL`             | unset                            |
    /// | `IMAGE_PULL_SECRETS`         | empty                            |
    /// | `IMAGE_PULL_SECRETS_DIR`     | `/etc/reana/pull-secrets`        |
    /// | `JOB_HOSTPATH_MOUNTS`        | empty                            |
    /// | `K8S_API_URL`                | `https://kubernetes.default.svc` |
    /// | `K8S_NAMESPACE`              | `default`                        |
    /// | `K8S_TOKEN_PATH`             | service-account token            |
    /// | `K8S_CA_PATH`                | service-account CA               |
    /// | `WORKFLOW_RUNTIME_USER_UID`  | unset                            |
    /// | `SLURM_PARTITION`            | `inf-short`                      |
    /// | `SLURM_HEADNODE_HOSTNAME`    | unset                            |
    /// | `SLURM_HEADNODE_PORT`        | `22`                             |
    /// | `HTCONDOR_SCHEDD_HOST`       | unset                            |
    /// | `HTCONDOR_SCHEDD_PORT`       | `22`                             |
    /// | `MONITOR_POLL_SECS`          | `5`                              |
    /// | `MONITOR_RESYNC_SECS`        | `60`                             |
    /// | `MONITOR_MISS_BUDGET`        | `3`                              |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup. `from_env`
    /// delegates here; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let get_opt = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let shared_volume_root = PathBuf::from(get("SHARED_VOLUME_PATH_ROOT", "/var/reana"));

        let mut enabled_backends = Vec::new();
        for name in parse_list(&get("COMPUTE_BACKENDS", "kubernetes")) {
            let backend = ComputeBackend::from_str(&name)?;
            if !enabled_backends.contains(&backend) {
                enabled_backends.push(backend);
            }
        }
        if enabled_backends.is_empty() {
            return Err(CoreError::Configuration(
                "COMPUTE_BACKENDS must name at least one backend".to_string(),
            ));
        }

        let default_backend =
            ComputeBackend::from_str(&get("DEFAULT_COMPUTE_BACKEND", "kubernetes"))?;
        if !enabled_backends.contains(&default_backend) {
            return Err(CoreError::Configuration(format!(
                "DEFAULT_COMPUTE_BACKEND '{default_backend}' is not in COMPUTE_BACKENDS"
            )));
        }

        let defaults = InjectionConfig::default();
        let injection = InjectionConfig {
            krb5_container_image: get("KRB5_CONTAINER_IMAGE", &defaults.krb5_container_image),
            krb5_container_name: defaults.krb5_container_name,
            krb5_token_cache_location: get_opt("KRB5_TOKEN_CACHE_LOCATION")
                .map(PathBuf::from)
                .unwrap_or(defaults.krb5_token_cache_location),
            krb5_token_cache_filename: get(
                "KRB5_TOKEN_CACHE_FILENAME",
                &defaults.krb5_token_cache_filename,
            ),
            krb5_configmap_name: get("KRB5_CONFIGMAP_NAME", &defaults.krb5_configmap_name),
            krb5_keytab_secret: get("KRB5_KEYTAB_SECRET", &defaults.krb5_keytab_secret),
            krb5_keytab_path: get_opt("KRB5_KEYTAB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.krb5_keytab_path),
            krb5_principal: get_opt("KRB5_PRINCIPAL"),
            image_pull_secrets: parse_list(&get("IMAGE_PULL_SECRETS", "")),
            image_pull_secrets_dir: get_opt("IMAGE_PULL_SECRETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_pull_secrets_dir),
            hostpath_mounts: parse_hostpath_mounts(&get("JOB_HOSTPATH_MOUNTS", ""))?,
        };

        let k8s_defaults = KubernetesConfig::default();
        let kubernetes = KubernetesConfig {
            api_url: get("K8S_API_URL", &k8s_defaults.api_url)
                .trim_end_matches('/')
                .to_string(),
            namespace: get("K8S_NAMESPACE", &k8s_defaults.namespace),
            token_path: get_opt("K8S_TOKEN_PATH")
                .map(PathBuf::from)
                .unwrap_or(k8s_defaults.token_path),
            ca_path: get_opt("K8S_CA_PATH")
                .map(PathBuf::from)
                .or(k8s_defaults.ca_path),
            runtime_user_uid: get_opt("WORKFLOW_RUNTIME_USER_UID")
                .map(|v| parse_number::<i64>("WORKFLOW_RUNTIME_USER_UID", &v))
                .transpose()?,
        };

        let slurm = SlurmConfig {
            partition: get("SLURM_PARTITION", &SlurmConfig::default().partition),
            headnode: parse_remote_host(
                get_opt("SLURM_HEADNODE_HOSTNAME"),
                "SLURM_HEADNODE_PORT",
                lookup("SLURM_HEADNODE_PORT"),
            )?,
        };

        let htcondor = HtCondorConfig {
            schedd_host: parse_remote_host(
                get_opt("HTCONDOR_SCHEDD_HOST"),
                "HTCONDOR_SCHEDD_PORT",
                lookup("HTCONDOR_SCHEDD_PORT"),
            )?,
        };

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            poll_interval: get_opt("MONITOR_POLL_SECS")
                .map(|v| parse_interval("MONITOR_POLL_SECS", &v))
                .transpose()?
                .unwrap_or(monitor_defaults.poll_interval),
            resync_interval: get_opt("MONITOR_RESYNC_SECS")
                .map(|v| parse_interval("MONITOR_RESYNC_SECS", &v))
                .transpose()?
                .unwrap_or(monitor_defaults.resync_interval),
            miss_budget: get_opt("MONITOR_MISS_BUDGET")
                .map(|v| parse_number::<u32>("MONITOR_MISS_BUDGET", &v))
                .transpose()?
                .unwrap_or(monitor_defaults.miss_budget)
                .max(1),
        };

        Ok(Self {
            shared_volume_root,
            enabled_backends,
            default_backend,
            injection,
            kubernetes,
            slurm,
            htcondor,
            monitor,
        })
    }

    /// Whether `backend` is in the enabled list.
    pub fn is_enabled(&self, backend: ComputeBackend) -> bool {
        self.enabled_backends.contains(&backend)
    }
}

/// Split a comma-separated value, trimming entries and dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `name:/host/path[:/mount/path]` entries, comma-separated. When
/// the mount path is omitted the host path is mounted at the same
/// location inside the job.
pub fn parse_hostpath_mounts(raw: &str) -> Result<Vec<VolumeMountSpec>, CoreError> {
    parse_list(raw)
        .into_iter()
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            let (name, host_path, mount_path) = match parts.as_slice() {
                [name, host] => (*name, *host, *host),
                [name, host, mount] => (*name, *host, *mount),
                _ => {
                    return Err(CoreError::Configuration(format!(
                        "Invalid JOB_HOSTPATH_MOUNTS entry '{entry}': expected \
                         name:/host/path[:/mount/path]"
                    )))
                }
            };
            Ok(VolumeMountSpec {
                name: name.to_string(),
                host_path: PathBuf::from(host_path),
                mount_path: PathBuf::from(mount_path),
            })
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CoreError> {
    value
        .parse()
        .map_err(|_| CoreError::Configuration(format!("{key} must be a number, got '{value}'")))
}

/// Whole seconds, never zero: a zero period would stall the timers.
fn parse_interval(key: &str, value: &str) -> Result<Duration, CoreError> {
    match parse_number::<u64>(key, value)? {
        0 => Err(CoreError::Configuration(format!("{key} must be at least 1"))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_remote_host(
    hostname: Option<String>,
    port_key: &str,
    port: Option<String>,
) -> Result<Option<RemoteHost>, CoreError> {
    let Some(hostname) = hostname else {
        return Ok(None);
    };
    let port = match port.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) {
        Some(p) => parse_number::<u16>(port_key, &p)?,
        None => 22,
    };
    Ok(Some(RemoteHost { hostname, port }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, CoreError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_enable_only_kubernetes() {
        let config = load(&[]).unwrap();
        assert_eq!(config.enabled_backends, vec![ComputeBackend::Kubernetes]);
        assert_eq!(config.default_backend, ComputeBackend::Kubernetes);
        assert_eq!(config.shared_volume_root, PathBuf::from("/var/reana"));
        assert_eq!(config.injection.krb5_token_cache_filename, "krb5_{}");
        assert!(config.injection.image_pull_secrets.is_empty());
        assert_eq!(config.monitor.miss_budget, 3);
    }

    #[test]
    fn parses_backend_list_and_dedups() {
        let config = load(&[(
            "COMPUTE_BACKENDS",
            "kubernetes, slurmcern,kubernetes,htcondorcern",
        )])
        .unwrap();
        assert_eq!(
            config.enabled_backends,
            vec![
                ComputeBackend::Kubernetes,
                ComputeBackend::Slurm,
                ComputeBackend::HtCondor
            ]
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert_matches!(
            load(&[("COMPUTE_BACKENDS", "kubernetes,pbs")]),
            Err(CoreError::Configuration(_))
        );
    }

    #[test]
    fn default_backend_must_be_enabled() {
        let result = load(&[
            ("COMPUTE_BACKENDS", "slurmcern"),
            ("DEFAULT_COMPUTE_BACKEND", "kubernetes"),
        ]);
        assert_matches!(result, Err(CoreError::Configuration(msg)) if msg.contains("DEFAULT_COMPUTE_BACKEND"));
    }

    #[test]
    fn empty_pull_secrets_yield_empty_list() {
        let config = load(&[("IMAGE_PULL_SECRETS", "")]).unwrap();
        assert!(config.injection.image_pull_secrets.is_empty());
        let config = load(&[("IMAGE_PULL_SECRETS", "gitlab, harbor")]).unwrap();
        assert_eq!(config.injection.image_pull_secrets, vec!["gitlab", "harbor"]);
    }

    #[test]
    fn parses_hostpath_mounts() {
        let mounts = parse_hostpath_mounts("mydata:/mydata, cvmfs:/cvmfs:/opt/cvmfs").unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, "mydata");
        assert_eq!(mounts[0].host_path, PathBuf::from("/mydata"));
        assert_eq!(mounts[0].mount_path, PathBuf::from("/mydata"));
        assert_eq!(mounts[1].mount_path, PathBuf::from("/opt/cvmfs"));
    }

    #[test]
    fn malformed_hostpath_mount_is_rejected() {
        assert!(parse_hostpath_mounts("justaname").is_err());
        assert!(parse_hostpath_mounts("a:/b:/c:/d").is_err());
    }

    #[test]
    fn headnode_port_defaults_to_22() {
        let config = load(&[
            ("COMPUTE_BACKENDS", "slurmcern"),
            ("DEFAULT_COMPUTE_BACKEND", "slurmcern"),
            ("SLURM_HEADNODE_HOSTNAME", "hpc-login.example.org"),
        ])
        .unwrap();
        assert_eq!(
            config.slurm.headnode,
            Some(RemoteHost {
                hostname: "hpc-login.example.org".into(),
                port: 22
            })
        );
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(load(&[("MONITOR_POLL_SECS", "soon")]).is_err());
        assert!(load(&[
            ("SLURM_HEADNODE_HOSTNAME", "h"),
            ("SLURM_HEADNODE_PORT", "70000")
        ])
        .is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert_matches!(
            load(&[("MONITOR_POLL_SECS", "0")]),
            Err(CoreError::Configuration(msg)) if msg.contains("MONITOR_POLL_SECS")
        );
        assert_matches!(
            load(&[("MONITOR_RESYNC_SECS", "0")]),
            Err(CoreError::Configuration(msg)) if msg.contains("MONITOR_RESYNC_SECS")
        );
        let config = load(&[("MONITOR_POLL_SECS", "1")]).unwrap();
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn miss_budget_is_at_least_one() {
        let config = load(&[("MONITOR_MISS_BUDGET", "0")]).unwrap();
        assert_eq!(config.monitor.miss_budget, 1);
    }
}
