//! Credential and volume injection.
//!
//! Pure functions computing what every submission must carry: host-path
//! volume mounts from the static allow-list, image-pull-secret
//! references, and (when the workflow needs Kerberos) either a ticket
//! cache sidecar or a ticket cache pre-staged into the job's working
//! directory. Plans are computed fresh per submission; the only
//! per-job variation is the cache filename templated with the workflow
//! id.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backend::ComputeBackend;
use crate::config::InjectionConfig;
use crate::error::CoreError;
use crate::types::WorkflowId;

/// Environment variable pointing Kerberos clients at the ticket cache.
pub const KRB5_CACHE_ENV: &str = "KRB5CCNAME";

/// Placeholder replaced with the workflow id in the cache filename template.
const TEMPLATE_PLACEHOLDER: &str = "{}";

/// Maximum length of a Kubernetes volume name (DNS-1123 label).
const MAX_VOLUME_NAME_LEN: usize = 63;

/// Volume names used by the job's own workspace and Kerberos volumes.
const RESERVED_VOLUME_NAME: &str = "workspace";
const RESERVED_VOLUME_PREFIX: &str = "krb5-";

/// Whether a volume name collides with the volumes every job carries.
pub fn is_reserved_volume_name(name: &str) -> bool {
    name == RESERVED_VOLUME_NAME || name.starts_with(RESERVED_VOLUME_PREFIX)
}

/// Kerberos ticket-cache sidecar attached next to the user container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarSpec {
    pub container_name: String,
    pub image_ref: String,
    /// Directory shared between the sidecar and the job container.
    pub shared_cache_path: PathBuf,
    /// Filename template, `{}` replaced with the workflow id.
    pub cache_filename_template: String,
}

impl SidecarSpec {
    /// Cache filename for one workflow, e.g. `krb5_<workflow_id>`.
    pub fn cache_file_name(&self, workflow_id: WorkflowId) -> String {
        render_template(&self.cache_filename_template, workflow_id)
    }

    /// Absolute path of the cache file inside the shared directory.
    pub fn cache_file_path(&self, workflow_id: WorkflowId) -> PathBuf {
        self.shared_cache_path.join(self.cache_file_name(workflow_id))
    }
}

/// A host path exposed inside every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMountSpec {
    pub name: String,
    pub host_path: PathBuf,
    pub mount_path: PathBuf,
}

/// Kerberos material used to obtain a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KerberosIdentity {
    pub principal: String,
    pub keytab_path: PathBuf,
    /// ConfigMap with krb5.conf (Kubernetes only).
    pub configmap_name: String,
    /// Secret with the keytab (Kubernetes only).
    pub keytab_secret: String,
}

/// Ticket cache to pre-stage into a batch job's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketStaging {
    /// Filename of the cache inside the working directory.
    pub cache_file_name: String,
}

impl TicketStaging {
    /// Path of the staged cache for a given working directory.
    pub fn cache_file_path(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.cache_file_name)
    }
}

/// Everything the injector attaches to one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InjectionPlan {
    /// Present iff Kerberos is required and the backend runs sidecars.
    pub sidecar: Option<SidecarSpec>,
    /// Present iff Kerberos is required and the backend has no sidecars.
    pub ticket_staging: Option<TicketStaging>,
    /// Present iff Kerberos is required.
    pub kerberos: Option<KerberosIdentity>,
    pub volumes: Vec<VolumeMountSpec>,
    pub image_pull_secrets: Vec<String>,
}

impl InjectionPlan {
    /// Value for [`KRB5_CACHE_ENV`] inside the job, given where the job
    /// runs. `None` when Kerberos is not required.
    pub fn kerberos_cache_env(
        &self,
        workflow_id: WorkflowId,
        working_dir: &Path,
    ) -> Option<String> {
        if let Some(sidecar) = &self.sidecar {
            return Some(format!(
                "FILE:{}",
                sidecar.cache_file_path(workflow_id).display()
            ));
        }
        self.ticket_staging
            .as_ref()
            .map(|staging| format!("FILE:{}", staging.cache_file_path(working_dir).display()))
    }
}

/// Compute the injection plan for one submission.
///
/// Returns [`CoreError::CredentialInjection`] when the static
/// configuration is unusable for this request.
pub fn plan_injection(
    config: &InjectionConfig,
    backend: ComputeBackend,
    workflow_id: WorkflowId,
    requires_kerberos: bool,
) -> Result<InjectionPlan, CoreError> {
    for volume in &config.hostpath_mounts {
        validate_volume(volume)?;
    }
    for secret in &config.image_pull_secrets {
        if !is_dns_label(secret, 253) {
            return Err(CoreError::CredentialInjection(format!(
                "Invalid image pull secret name: '{secret}'"
            )));
        }
    }

    let mut plan = InjectionPlan {
        volumes: config.hostpath_mounts.clone(),
        image_pull_secrets: config.image_pull_secrets.clone(),
        ..Default::default()
    };

    if !requires_kerberos {
        return Ok(plan);
    }

    validate_template(&config.krb5_token_cache_filename)?;
    let principal = config
        .krb5_principal
        .clone()
        .ok_or_else(|| {
            CoreError::CredentialInjection(
                "Kerberos required but KRB5_PRINCIPAL is not configured".to_string(),
            )
        })?;
    plan.kerberos = Some(KerberosIdentity {
        principal,
        keytab_path: config.krb5_keytab_path.clone(),
        configmap_name: config.krb5_configmap_name.clone(),
        keytab_secret: config.krb5_keytab_secret.clone(),
    });

    if backend.supports_sidecar() {
        if config.krb5_container_image.trim().is_empty() {
            return Err(CoreError::CredentialInjection(
                "KRB5_CONTAINER_IMAGE must not be empty".to_string(),
            ));
        }
        if !config.krb5_token_cache_location.is_absolute() {
            return Err(CoreError::CredentialInjection(format!(
                "KRB5_TOKEN_CACHE_LOCATION '{}' must be absolute",
                config.krb5_token_cache_location.display()
            )));
        }
        plan.sidecar = Some(SidecarSpec {
            container_name: config.krb5_container_name.clone(),
            image_ref: config.krb5_container_image.clone(),
            shared_cache_path: config.krb5_token_cache_location.clone(),
            cache_filename_template: config.krb5_token_cache_filename.clone(),
        });
    } else {
        plan.ticket_staging = Some(TicketStaging {
            cache_file_name: render_template(&config.krb5_token_cache_filename, workflow_id),
        });
    }

    Ok(plan)
}

fn render_template(template: &str, workflow_id: WorkflowId) -> String {
    template.replacen(TEMPLATE_PLACEHOLDER, &workflow_id.to_string(), 1)
}

fn validate_template(template: &str) -> Result<(), CoreError> {
    if !template.contains(TEMPLATE_PLACEHOLDER) {
        return Err(CoreError::CredentialInjection(format!(
            "KRB5_TOKEN_CACHE_FILENAME '{template}' must contain a '{{}}' placeholder"
        )));
    }
    if template.contains('/') {
        return Err(CoreError::CredentialInjection(format!(
            "KRB5_TOKEN_CACHE_FILENAME '{template}' must be a bare filename"
        )));
    }
    Ok(())
}

fn validate_volume(volume: &VolumeMountSpec) -> Result<(), CoreError> {
    if !is_dns_label(&volume.name, MAX_VOLUME_NAME_LEN) || volume.name.contains('.') {
        return Err(CoreError::CredentialInjection(format!(
            "Invalid volume name '{}': must be a lowercase DNS label",
            volume.name
        )));
    }
    if is_reserved_volume_name(&volume.name) {
        return Err(CoreError::CredentialInjection(format!(
            "Volume name '{}' is reserved",
            volume.name
        )));
    }
    if !volume.host_path.is_absolute() || !volume.mount_path.is_absolute() {
        return Err(CoreError::CredentialInjection(format!(
            "Volume '{}' paths must be absolute",
            volume.name
        )));
    }
    Ok(())
}

/// Lowercase alphanumerics, `-` and `.`, starting and ending alphanumeric.
fn is_dns_label(name: &str, max_len: usize) -> bool {
    !name.is_empty()
        && name.len() <= max_len
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}
