use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::config::TransportConfig;
use crate::error::RemoteError;
use crate::remote::command::{
    classify_failure, BackgroundHandle, ExecMode, Execution, Invocation, RemoteCommand,
    RemoteOutput,
};

/// Runs commands on worker hosts.
///
/// `run` waits for the command and hands back its exit code and output; a
/// non-zero exit is still `Ok` so callers can read status queries such as `pgrep`.
/// Only failures of the transport itself (unreachable host, timeout, missing
/// transport binary) surface as `Err`. `spawn` starts the command in the
/// background and returns without waiting; a later non-zero exit of that
/// command is reported by `background_failure`.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<RemoteOutput, RemoteError>;

    async fn spawn(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<BackgroundHandle, RemoteError>;

    /// Copy a local file to `remote_path` on `host`.
    async fn copy_to(
        &self,
        host: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError>;

    /// Failure of the most recent command spawned on `host`, once it has
    /// exited non-zero. `None` while it runs or after a clean exit.
    fn background_failure(&self, _host: &str) -> Option<RemoteError> {
        None
    }

    async fn execute(&self, invocation: &Invocation) -> Result<Execution, RemoteError> {
        match invocation.mode {
            ExecMode::Sync => self
                .run(&invocation.host, &invocation.command)
                .await
                .map(Execution::Completed),
            ExecMode::Async => self
                .spawn(&invocation.host, &invocation.command)
                .await
                .map(Execution::Detached),
        }
    }
}

/// [`RemoteExecutor`] over OpenSSH's `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: TransportConfig,
    /// Non-zero exits of background commands, by host
    exits: Arc<Mutex<HashMap<String, RemoteError>>>,
}

impl SshExecutor {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            exits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn transport_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ]
    }

    fn ssh(&self, host: &str, command: &RemoteCommand) -> Command {
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.args(self.transport_options())
            .arg(host)
            .arg(command.render());
        cmd
    }

    async fn output(
        &self,
        host: &str,
        program: &str,
        mut cmd: Command,
    ) -> Result<RemoteOutput, RemoteError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.config.command_timeout;
        let result = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RemoteError::Timeout {
                host: host.to_string(),
                secs: timeout.as_secs(),
            })?;

        let output = result.map_err(|e| RemoteError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        Ok(RemoteOutput {
            host: host.to_string(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<RemoteOutput, RemoteError> {
        tracing::debug!(host, command = %command, "Running remote command");

        let output = self
            .output(host, &self.config.ssh_program, self.ssh(host, command))
            .await?;

        // 255 is ssh's own failure status, never the remote command's.
        if output.code == Some(255) {
            return Err(classify_failure(host, output.code, &output.stderr));
        }
        Ok(output)
    }

    async fn spawn(
        &self,
        host: &str,
        command: &RemoteCommand,
    ) -> Result<BackgroundHandle, RemoteError> {
        if let Ok(mut exits) = self.exits.lock() {
            exits.remove(host);
        }

        let child = self
            .ssh(host, command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RemoteError::Spawn {
                program: self.config.ssh_program.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        tracing::info!(host, pid = ?pid, command = %command, "Started background command");

        let exits = Arc::clone(&self.exits);
        let owner = host.to_string();
        let program = self.config.ssh_program.clone();
        tokio::spawn(async move {
            let error = match child.wait_with_output().await {
                Ok(output) if output.status.success() => return,
                Ok(output) => classify_failure(
                    &owner,
                    output.status.code(),
                    &String::from_utf8_lossy(&output.stderr),
                ),
                Err(e) => RemoteError::Spawn {
                    program,
                    reason: e.to_string(),
                },
            };
            tracing::warn!(host = %owner, error = %error, "Background command failed");
            if let Ok(mut exits) = exits.lock() {
                exits.insert(owner, error);
            }
        });

        Ok(BackgroundHandle {
            host: host.to_string(),
            pid,
            started_at: Utc::now(),
        })
    }

    fn background_failure(&self, host: &str) -> Option<RemoteError> {
        self.exits.lock().ok()?.get(host).cloned()
    }

    async fn copy_to(
        &self,
        host: &str,
        local: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        tracing::debug!(host, local = %local.display(), remote_path, "Copying file");

        let mut cmd = Command::new(&self.config.scp_program);
        cmd.args(self.transport_options())
            .arg(local)
            .arg(format!("{}:{}", host, remote_path));

        self.output(host, &self.config.scp_program, cmd)
            .await?
            .check()
            .map(|_| ())
    }
}
