//! Remote command channel: local `sh -c` or `ssh`, always bounded by a timeout.

use super::net::is_local;
use crate::config::ClusterConfig;
use crate::error::{DistError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Captured outcome of one command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes shell commands on a destination
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` on `address` and wait for it, at most `timeout`
    async fn run(&self, address: &str, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Copy a local file or directory to `remote_path` on `address`
    async fn copy_to(
        &self,
        address: &str,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Command runner backed by `sh` for local addresses and `ssh`/`scp` otherwise
#[derive(Debug, Clone)]
pub struct ShellRunner {
    ssh_binary: String,
    scp_binary: String,
    ssh_options: Vec<String>,
}

impl ShellRunner {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            ssh_binary: config.ssh_binary.clone(),
            scp_binary: config.scp_binary.clone(),
            ssh_options: config.ssh_options.clone(),
        }
    }

    fn command_for(&self, address: &str, command: &str) -> Command {
        if is_local(address) {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let mut cmd = Command::new(&self.ssh_binary);
            cmd.args(&self.ssh_options).arg(address).arg(command);
            cmd
        }
    }

    async fn execute(address: &str, mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| DistError::connection(address, format!("failed to spawn: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(DistError::connection(address, e.to_string())),
            Err(_) => Err(DistError::connection(
                address,
                format!("command timed out after {}s", timeout.as_secs_f64()),
            )),
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, address: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        tracing::debug!("[{}] $ {}", address, command);
        let output = Self::execute(address, self.command_for(address, command), timeout).await?;
        if !output.success() {
            tracing::debug!(
                "[{}] exited with {:?}: {}",
                address,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }

    async fn copy_to(
        &self,
        address: &str,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let local = local_path.display().to_string();

        if is_local(address) {
            let target = if remote_path.starts_with('/') {
                shell_quote(remote_path)
            } else {
                format!("\"$HOME\"/{}", shell_quote(remote_path))
            };
            let command = format!("mkdir -p {target} && cp -r {} {target}/", shell_quote(&local));
            return self.run(address, &command, timeout).await;
        }

        tracing::debug!("[{}] copy {} -> {}", address, local, remote_path);
        let prepare = format!("mkdir -p {}", shell_quote(remote_path));
        let prepared = self.run(address, &prepare, timeout).await?;
        if !prepared.success() {
            return Ok(prepared);
        }

        let mut cmd = Command::new(&self.scp_binary);
        cmd.args(&self.ssh_options)
            .arg("-r")
            .arg(&local)
            .arg(format!("{address}:{remote_path}/"));
        Self::execute(address, cmd, timeout).await
    }
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// A command started in the background; joined by [`BackgroundJobs::flush`]
pub struct BackgroundJob {
    pub id: String,
    pub address: String,
    pub command: String,
    handle: JoinHandle<Result<CommandOutput>>,
}

/// Outcome of a flushed background job
#[derive(Debug)]
pub struct FlushedJob {
    pub id: String,
    pub address: String,
    pub result: Result<CommandOutput>,
}

/// Outstanding background commands with an explicit flush/join
#[derive(Default)]
pub struct BackgroundJobs {
    jobs: Mutex<Vec<BackgroundJob>>,
}

impl BackgroundJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `command` on `address` without waiting for it
    pub async fn spawn(
        &self,
        runner: Arc<dyn CommandRunner>,
        id: impl Into<String>,
        address: &str,
        command: &str,
        timeout: Duration,
    ) {
        let id = id.into();
        let job_address = address.to_string();
        let job_command = command.to_string();
        let handle = tokio::spawn(async move {
            runner.run(&job_address, &job_command, timeout).await
        });

        tracing::debug!("Background job {} started on {}", id, address);
        self.jobs.lock().await.push(BackgroundJob {
            id,
            address: address.to_string(),
            command: command.to_string(),
            handle,
        });
    }

    /// Ids of jobs that have not finished yet
    pub async fn pending(&self) -> Vec<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|job| !job.handle.is_finished())
            .map(|job| job.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Wait for every outstanding job and return their outcomes in start order.
    pub async fn flush(&self) -> Vec<FlushedJob> {
        let jobs = std::mem::take(&mut *self.jobs.lock().await);
        let mut flushed = Vec::with_capacity(jobs.len());

        for job in jobs {
            let result = match job.handle.await {
                Ok(result) => result,
                Err(e) => Err(DistError::connection(
                    &job.address,
                    format!("background job {} aborted: {e}", job.id),
                )),
            };
            flushed.push(FlushedJob {
                id: job.id,
                address: job.address,
                result,
            });
        }

        flushed
    }
}
