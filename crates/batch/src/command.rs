//! Running batch-system client commands.
//!
//! [`CommandRunner`] is the seam the backends and monitors are written
//! against. [`LocalRunner`] spawns the command here; [`SshRunner`] runs
//! it on a head node through `ssh`. Both pipe an optional stdin payload,
//! capture stdout/stderr, and enforce a timeout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobctl_core::config::RemoteHost;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Default timeout for one batch client invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A command to run: program, arguments, optional stdin payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// The whole command as one POSIX shell string.
    pub fn to_shell(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether stdout or stderr mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Errors from starting or waiting for a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The process could not be spawned or waited on.
    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish in time and was killed.
    #[error("{program} timed out after {elapsed_ms} ms")]
    Timeout { program: String, elapsed_ms: u64 },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands on this host.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        run_command(&mut cmd, &spec.program, spec.stdin.as_deref(), self.timeout).await
    }
}

/// Runs commands on a remote head node through `ssh`.
///
/// Authentication is whatever the controller's ssh configuration
/// provides; `BatchMode` makes a missing key fail fast instead of
/// prompting.
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: RemoteHost,
    timeout: Duration,
}

impl SshRunner {
    pub fn new(host: RemoteHost, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    /// The local `ssh` invocation that runs `spec` remotely.
    pub fn ssh_command(&self, spec: &CommandSpec) -> CommandSpec {
        CommandSpec {
            program: "ssh".to_string(),
            args: vec![
                "-p".to_string(),
                self.host.port.to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                self.host.hostname.clone(),
                "--".to_string(),
                spec.to_shell(),
            ],
            stdin: spec.stdin.clone(),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let ssh = self.ssh_command(spec);
        let mut cmd = Command::new(&ssh.program);
        cmd.args(&ssh.args);
        run_command(&mut cmd, &spec.program, ssh.stdin.as_deref(), self.timeout).await
    }
}

/// Local runner, or an ssh runner when a head node is configured.
pub fn runner_for(host: Option<&RemoteHost>, timeout: Duration) -> Arc<dyn CommandRunner> {
    match host {
        Some(host) => Arc::new(SshRunner::new(host.clone(), timeout)),
        None => Arc::new(LocalRunner::new(timeout)),
    }
}

/// Quote one word for a POSIX shell. Words made only of safe characters
/// are left alone.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

// ---- private helpers ----

/// Spawn `cmd`, write `stdin`, capture output, and enforce `timeout`.
async fn run_command(
    cmd: &mut Command,
    program: &str,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    // `kill_on_drop(true)` kills the child when the timeout drops it.
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let io_error = |source| CommandError::Io {
        program: program.to_string(),
        source,
    };

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(io_error)?;

    if let Some(mut handle) = child.stdin.take() {
        if let Some(payload) = stdin {
            // The process may exit without reading stdin.
            let _ = handle.write_all(payload.as_bytes()).await;
        }
        drop(handle);
    }

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let output = CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: status.code().unwrap_or(-1),
            };
            tracing::debug!(
                program,
                exit_code = output.exit_code,
                duration_ms = start.elapsed().as_millis() as u64,
                "Batch command finished",
            );
            Ok(output)
        }
        Ok(Err(e)) => Err(io_error(e)),
        Err(_elapsed) => Err(CommandError::Timeout {
            program: program.to_string(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn quoting_leaves_safe_words_alone() {
        assert_eq!(shell_quote("sbatch"), "sbatch");
        assert_eq!(shell_quote("--jobs=1,2"), "--jobs=1,2");
        assert_eq!(shell_quote("/var/reana/wf"), "/var/reana/wf");
    }

    #[test]
    fn quoting_wraps_unsafe_words() {
        assert_eq!(shell_quote("ClusterId == 1"), "'ClusterId == 1'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn ssh_command_wraps_the_remote_invocation() {
        let runner = SshRunner::new(
            RemoteHost {
                hostname: "hpc-login.example".into(),
                port: 2222,
            },
            DEFAULT_COMMAND_TIMEOUT,
        );
        let spec = CommandSpec::new("condor_q", ["-constraint", "ClusterId == 5"])
            .with_stdin("payload");
        let ssh = runner.ssh_command(&spec);
        assert_eq!(ssh.program, "ssh");
        assert_eq!(
            ssh.args,
            [
                "-p",
                "2222",
                "-o",
                "BatchMode=yes",
                "hpc-login.example",
                "--",
                "condor_q -constraint 'ClusterId == 5'",
            ]
        );
        assert_eq!(ssh.stdin.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn local_runner_captures_output_and_exit_code() {
        let runner = LocalRunner::default();
        let output = runner
            .run(&CommandSpec::new("sh", ["-c", "cat; echo oops >&2; exit 3"]).with_stdin("hello"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert!(output.mentions("oops"));
    }

    #[tokio::test]
    async fn local_runner_times_out() {
        let runner = LocalRunner::new(Duration::from_millis(100));
        assert_matches!(
            runner.run(&CommandSpec::new("sleep", ["5"])).await,
            Err(CommandError::Timeout { .. })
        );
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let runner = LocalRunner::default();
        assert_matches!(
            runner
                .run(&CommandSpec::new("jobctl-no-such-binary", Vec::<String>::new()))
                .await,
            Err(CommandError::Io { .. })
        );
    }
}
