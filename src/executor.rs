//! Command execution substrate for managed hosts.
//!
//! Every configuration change the controller makes happens through this
//! module: a single synchronous-looking `execute` call that runs a shell
//! command either locally (the controller's own machine) or on a remote
//! host over SSH. The executor is stateless; serialization of conflicting
//! operations is the caller's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Result of one command invocation. Exit code `-1` means the command never
/// ran to completion (spawn failure or timeout); the reason is in `stderr`.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn not_run(reason: impl Into<String>) -> Self {
        CommandOutput {
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }
}

/// Secret used to open a remote shell. Stored verbatim in the host
/// registry; this is a documented lab-grade limitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    Password(String),
    KeyFile(String),
}

/// Where a command should run.
#[derive(Debug, Clone)]
pub enum ExecTarget {
    /// The controller's own process environment.
    Local,
    /// A host reached over SSH at its management address.
    Remote {
        address: String,
        username: String,
        credential: Credential,
    },
}

impl ExecTarget {
    pub fn label(&self) -> &str {
        match self {
            ExecTarget::Local => "localhost",
            ExecTarget::Remote { address, .. } => address,
        }
    }
}

/// The seam every manager drives commands through. Production uses
/// [`ShellExecutor`]; tests substitute a scripted implementation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, target: &ExecTarget, command: &str, timeout: Duration)
    -> CommandOutput;

    /// Same contract with a byte payload piped to the child's stdin. Used to
    /// deploy rendered configuration files through `tee` without any shell
    /// quoting of the content.
    async fn execute_with_input(
        &self,
        target: &ExecTarget,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> CommandOutput;
}

/// Drives `sh -c` locally and `ssh`/`sshpass` remotely, with strict
/// host-key checking disabled and a bounded connect timeout.
pub struct ShellExecutor {
    connect_timeout_secs: u64,
}

impl ShellExecutor {
    pub fn new(connect_timeout_secs: u64) -> Self {
        ShellExecutor {
            connect_timeout_secs,
        }
    }

    fn build_command(&self, target: &ExecTarget, command: &str) -> Command {
        match target {
            ExecTarget::Local => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", command]);
                cmd
            }
            ExecTarget::Remote {
                address,
                username,
                credential,
            } => {
                let ssh_opts = [
                    "-o".to_string(),
                    "StrictHostKeyChecking=no".to_string(),
                    "-o".to_string(),
                    format!("ConnectTimeout={}", self.connect_timeout_secs),
                ];
                let destination = format!("{}@{}", username, address);

                match credential {
                    Credential::Password(password) => {
                        let mut cmd = Command::new("sshpass");
                        cmd.args(["-p", password, "ssh"]);
                        cmd.args(&ssh_opts);
                        cmd.args([destination.as_str(), command]);
                        cmd
                    }
                    Credential::KeyFile(path) => {
                        let mut cmd = Command::new("ssh");
                        cmd.args(["-i", path]);
                        cmd.args(&ssh_opts);
                        cmd.args([destination.as_str(), command]);
                        cmd
                    }
                }
            }
        }
    }

    async fn run(
        &self,
        target: &ExecTarget,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> CommandOutput {
        debug!(target = target.label(), command, "executing");

        let mut cmd = self.build_command(target, command);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return CommandOutput::not_run(err.to_string()),
        };

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(payload).await {
                    return CommandOutput::not_run(format!("failed to write stdin: {}", err));
                }
                // Close stdin so the child sees EOF.
                drop(stdin);
            }
        }

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(err)) => CommandOutput::not_run(err.to_string()),
            Err(_) => {
                CommandOutput::not_run(format!("timed out after {} seconds", timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ShellExecutor {
    async fn execute(
        &self,
        target: &ExecTarget,
        command: &str,
        timeout: Duration,
    ) -> CommandOutput {
        self.run(target, command, None, timeout).await
    }

    async fn execute_with_input(
        &self,
        target: &ExecTarget,
        command: &str,
        input: &[u8],
        timeout: Duration,
    ) -> CommandOutput {
        self.run(target, command, Some(input), timeout).await
    }
}
