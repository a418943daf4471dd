//! Workspace preparation shared by the batch backends.
//!
//! Batch schedulers cannot run a ticket-renewing sidecar, so a Kerberos
//! ticket cache is obtained before submission and written into the
//! job's working directory. The control directory holding scheduler
//! logs and exit-code files is created at the same time.
//!
//! Registry credentials are docker config directories under the pull
//! secrets directory. A single secret is used in place; several are
//! merged into one `config.json` under the control directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use jobctl_core::config::ControllerConfig;
use jobctl_core::error::SubmissionError;
use jobctl_core::injector::{InjectionPlan, KRB5_CACHE_ENV};
use jobctl_core::job::JobRequest;

use serde_json::{Map, Value};

use crate::command::{shell_quote, CommandError, CommandRunner, CommandSpec};

/// Directory under the workspace for scheduler output and exit codes.
pub const CONTROL_DIR: &str = ".jobctl";

/// Environment variable pointing container tools at registry credentials.
pub const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";

/// Merged registry credentials, relative to the control directory.
const MERGED_DOCKER_CONFIG_DIR: &str = "docker";

/// Filesystem layout shared by the batch backends.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub shared_volume_root: PathBuf,
    pub pull_secrets_dir: PathBuf,
}

impl BatchSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            shared_volume_root: config.shared_volume_root.clone(),
            pull_secrets_dir: config.injection.image_pull_secrets_dir.clone(),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            shared_volume_root: PathBuf::from("/var/reana"),
            pull_secrets_dir: PathBuf::from("/etc/reana/pull-secrets"),
        }
    }
}

pub fn control_dir(workspace: &Path) -> PathBuf {
    workspace.join(CONTROL_DIR)
}

/// Scheduler output, error, and exit-code files of one batch job.
pub fn output_file(workspace: &Path, backend_job_id: &str, extension: &str) -> PathBuf {
    control_dir(workspace).join(format!("{backend_job_id}.{extension}"))
}

/// Docker config directory a batch job should use, if any secret is
/// configured.
pub fn docker_config_dir(
    plan: &InjectionPlan,
    workspace: &Path,
    pull_secrets_dir: &Path,
) -> Option<PathBuf> {
    match plan.image_pull_secrets.as_slice() {
        [] => None,
        [secret] => Some(pull_secrets_dir.join(secret)),
        _ => Some(control_dir(workspace).join(MERGED_DOCKER_CONFIG_DIR)),
    }
}

/// Create the control directory, merge registry credentials when more
/// than one secret is configured and, when Kerberos is required, stage
/// a fresh ticket cache into the workspace.
pub async fn prepare_workspace(
    runner: &dyn CommandRunner,
    plan: &InjectionPlan,
    workspace: &Path,
    pull_secrets_dir: &Path,
) -> Result<(), SubmissionError> {
    let mkdir = CommandSpec::new(
        "mkdir",
        ["-p".to_string(), control_dir(workspace).display().to_string()],
    );
    let output = runner.run(&mkdir).await.map_err(unreachable)?;
    if !output.success() {
        return Err(SubmissionError::Configuration(format!(
            "Cannot create {}: {}",
            control_dir(workspace).display(),
            output.stderr.trim()
        )));
    }

    if plan.image_pull_secrets.len() > 1 {
        merge_pull_secrets(
            runner,
            &plan.image_pull_secrets,
            pull_secrets_dir,
            &control_dir(workspace).join(MERGED_DOCKER_CONFIG_DIR),
        )
        .await?;
    }

    let (Some(staging), Some(identity)) = (&plan.ticket_staging, &plan.kerberos) else {
        return Ok(());
    };
    let cache = staging.cache_file_path(workspace);
    let kinit = CommandSpec::new(
        "kinit",
        [
            "-kt".to_string(),
            identity.keytab_path.display().to_string(),
            "-c".to_string(),
            format!("FILE:{}", cache.display()),
            identity.principal.clone(),
        ],
    );
    let output = runner.run(&kinit).await.map_err(unreachable)?;
    if !output.success() {
        return Err(SubmissionError::CredentialInjection(format!(
            "kinit for {} failed: {}",
            identity.principal,
            output.stderr.trim()
        )));
    }

    tracing::debug!(
        principal = %identity.principal,
        cache = %cache.display(),
        "Kerberos ticket cache staged",
    );
    Ok(())
}

/// Environment of a batch job: the request's variables plus the ticket
/// cache location and registry credentials from the injection plan.
pub fn job_environment(
    request: &JobRequest,
    plan: &InjectionPlan,
    workspace: &Path,
    pull_secrets_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env = request.env_vars().clone();
    if let Some(value) = plan.kerberos_cache_env(request.workflow_id(), workspace) {
        env.insert(KRB5_CACHE_ENV.to_string(), value);
    }
    if let Some(dir) = docker_config_dir(plan, workspace, pull_secrets_dir) {
        env.insert(DOCKER_CONFIG_ENV.to_string(), dir.display().to_string());
    }
    env
}

/// Union of the `auths` of every secret's `config.json`. The first secret
/// naming a registry wins.
async fn merge_pull_secrets(
    runner: &dyn CommandRunner,
    secrets: &[String],
    pull_secrets_dir: &Path,
    target: &Path,
) -> Result<(), SubmissionError> {
    let mut auths = Map::new();
    for secret in secrets {
        let path = pull_secrets_dir.join(secret).join("config.json");
        let cat = CommandSpec::new("cat", [path.display().to_string()]);
        let output = runner.run(&cat).await.map_err(unreachable)?;
        if !output.success() {
            return Err(SubmissionError::CredentialInjection(format!(
                "Cannot read pull secret {secret}: {}",
                output.stderr.trim()
            )));
        }
        let config: Value = serde_json::from_str(&output.stdout).map_err(|e| {
            SubmissionError::CredentialInjection(format!(
                "Pull secret {secret} is not a docker config: {e}"
            ))
        })?;
        if let Some(entries) = config.get("auths").and_then(Value::as_object) {
            for (registry, auth) in entries {
                auths
                    .entry(registry.clone())
                    .or_insert_with(|| auth.clone());
            }
        }
    }

    let file = target.join("config.json");
    let write = CommandSpec::new(
        "sh",
        [
            "-c".to_string(),
            format!(
                "mkdir -p {} && umask 077 && cat > {}",
                shell_quote(&target.display().to_string()),
                shell_quote(&file.display().to_string())
            ),
        ],
    )
    .with_stdin(serde_json::json!({ "auths": auths }).to_string());
    let output = runner.run(&write).await.map_err(unreachable)?;
    if !output.success() {
        return Err(SubmissionError::CredentialInjection(format!(
            "Cannot write {}: {}",
            file.display(),
            output.stderr.trim()
        )));
    }

    tracing::debug!(
        secrets = secrets.len(),
        registries = auths.len(),
        config = %file.display(),
        "Pull secrets merged",
    );
    Ok(())
}

pub(crate) fn unreachable(err: CommandError) -> SubmissionError {
    SubmissionError::Unreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use jobctl_core::backend::ComputeBackend;
    use jobctl_core::config::InjectionConfig;
    use jobctl_core::injector::plan_injection;
    use uuid::Uuid;

    use super::*;
    use crate::command::fake::{failed, ok, FakeRunner};

    fn kerberos_plan(request: &JobRequest) -> InjectionPlan {
        let config = InjectionConfig {
            krb5_principal: Some("reana@CERN.CH".into()),
            image_pull_secrets: vec!["gitlab-registry".into()],
            ..Default::default()
        };
        plan_injection(&config, ComputeBackend::Slurm, request.workflow_id(), true).unwrap()
    }

    #[tokio::test]
    async fn stages_ticket_into_workspace() {
        let runner = FakeRunner::new();
        let request =
            JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4()).with_kerberos(true);
        let plan = kerberos_plan(&request);
        let ws = Path::new("/var/reana/wf");

        prepare_workspace(&runner, &plan, ws, Path::new("/etc/reana/pull-secrets"))
            .await
            .unwrap();

        let mkdir = runner.calls_to("mkdir").await;
        assert_eq!(mkdir[0].args, ["-p", "/var/reana/wf/.jobctl"]);
        let kinit = runner.calls_to("kinit").await;
        assert_eq!(kinit.len(), 1);
        let cache = format!("FILE:/var/reana/wf/krb5_{}", request.workflow_id());
        assert_eq!(
            kinit[0].args,
            [
                "-kt",
                "/etc/reana/secrets/.keytab",
                "-c",
                cache.as_str(),
                "reana@CERN.CH",
            ]
        );
    }

    #[tokio::test]
    async fn no_kerberos_means_no_kinit() {
        let runner = FakeRunner::new();
        prepare_workspace(&runner, &InjectionPlan::default(), Path::new("/ws"), Path::new("/ps"))
            .await
            .unwrap();
        assert!(runner.calls_to("kinit").await.is_empty());
    }

    #[tokio::test]
    async fn failed_kinit_is_a_credential_error() {
        let runner = FakeRunner::new();
        runner
            .push("kinit", failed(1, "Keytab contains no suitable keys"))
            .await;
        let request =
            JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4()).with_kerberos(true);
        assert_matches!(
            prepare_workspace(&runner, &kerberos_plan(&request), Path::new("/ws"), Path::new("/ps"))
                .await,
            Err(SubmissionError::CredentialInjection(msg)) if msg.contains("no suitable keys")
        );
    }

    #[tokio::test]
    async fn local_workspace_gets_control_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = crate::command::LocalRunner::default();
        prepare_workspace(&runner, &InjectionPlan::default(), dir.path(), dir.path())
            .await
            .unwrap();
        assert!(control_dir(dir.path()).is_dir());

        std::fs::write(output_file(dir.path(), "9", "out"), "hello\n").unwrap();
        let logs = crate::monitor::read_files(
            &runner,
            &[
                output_file(dir.path(), "9", "out"),
                output_file(dir.path(), "9", "err"),
            ],
        )
        .await;
        assert_eq!(logs.as_deref(), Some("9.out:\nhello\n\n"));
    }

    #[test]
    fn environment_carries_cache_and_docker_config() {
        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4())
            .with_kerberos(true)
            .with_env_var("FOO", "bar");
        let plan = kerberos_plan(&request);
        let env = job_environment(
            &request,
            &plan,
            Path::new("/var/reana/wf"),
            Path::new("/etc/reana/pull-secrets"),
        );
        assert_eq!(env["FOO"], "bar");
        assert_eq!(
            env[KRB5_CACHE_ENV],
            format!("FILE:/var/reana/wf/krb5_{}", request.workflow_id())
        );
        assert_eq!(env[DOCKER_CONFIG_ENV], "/etc/reana/pull-secrets/gitlab-registry");
    }

    fn two_secret_plan() -> InjectionPlan {
        InjectionPlan {
            image_pull_secrets: vec!["gitlab-registry".into(), "harbor".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn several_pull_secrets_are_merged() {
        let runner = FakeRunner::new();
        runner
            .push("cat", ok(r#"{"auths":{"gitlab.cern.ch":{"auth":"Zmlyc3Q="}}}"#))
            .await;
        runner
            .push(
                "cat",
                ok(r#"{"auths":{"registry.cern.ch":{"auth":"c2Vjb25k"},"gitlab.cern.ch":{"auth":"bG9zZXI="}}}"#),
            )
            .await;
        let ws = Path::new("/var/reana/wf");

        prepare_workspace(&runner, &two_secret_plan(), ws, Path::new("/etc/reana/pull-secrets"))
            .await
            .unwrap();

        let reads = runner.calls_to("cat").await;
        assert_eq!(reads[0].args, ["/etc/reana/pull-secrets/gitlab-registry/config.json"]);
        assert_eq!(reads[1].args, ["/etc/reana/pull-secrets/harbor/config.json"]);

        let write = &runner.calls_to("sh").await[0];
        assert!(write.args[1].contains("cat > /var/reana/wf/.jobctl/docker/config.json"));
        let merged: Value = serde_json::from_str(write.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(merged["auths"]["gitlab.cern.ch"]["auth"], "Zmlyc3Q=");
        assert_eq!(merged["auths"]["registry.cern.ch"]["auth"], "c2Vjb25k");

        let request = JobRequest::new("busybox", vec!["ls".into()], Uuid::new_v4());
        let env = job_environment(
            &request,
            &two_secret_plan(),
            ws,
            Path::new("/etc/reana/pull-secrets"),
        );
        assert_eq!(env[DOCKER_CONFIG_ENV], "/var/reana/wf/.jobctl/docker");
    }

    #[tokio::test]
    async fn unreadable_pull_secret_fails_preparation() {
        let runner = FakeRunner::new();
        runner.push("cat", failed(1, "No such file or directory")).await;
        assert_matches!(
            prepare_workspace(&runner, &two_secret_plan(), Path::new("/ws"), Path::new("/ps")).await,
            Err(SubmissionError::CredentialInjection(msg)) if msg.contains("gitlab-registry")
        );
        assert!(runner.calls_to("sh").await.is_empty());
    }
}
