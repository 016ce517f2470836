use std::{path::Path, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use super::{error::ErrorKind, stack};

const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("build timed out")]
    Timeout,
    #[error("build cancelled")]
    Cancelled,
    #[error("build failed with exit code {0:?}")]
    Failed(Option<i32>),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Timeout => ErrorKind::Timeout,
            BuildError::Cancelled => ErrorKind::Cancelled,
            BuildError::Failed(_) => ErrorKind::External,
            BuildError::Io(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub command: String,
    pub exit_code: i32,
}

/// Runs the stack's build command inside the workspace, streaming captured
/// output line by line.
#[derive(Clone, Default)]
pub struct BuildService;

impl BuildService {
    pub fn new() -> Self {
        Self
    }

    pub async fn build(
        &self,
        workspace: &Path,
        language: &str,
        framework: Option<&str>,
        logs: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildError> {
        let profile = stack::resolve(language, framework);
        self.run_command(workspace, profile.build_command, logs, cancel, BUILD_TIMEOUT)
            .await
    }

    /// Runs `command` through the shell with interleaved stdout/stderr
    /// capture. Cancellation kills the child; the command then counts as
    /// CANCELLED, not failed.
    pub async fn run_command(
        &self,
        workspace: &Path,
        command: &str,
        logs: mpsc::UnboundedSender<String>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<BuildOutcome, BuildError> {
        tracing::info!(command, workspace = %workspace.display(), "running build command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = logs.send(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = logs.send(line);
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BuildError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(BuildError::Timeout);
            }
        };

        if status.success() {
            Ok(BuildOutcome {
                command: command.to_string(),
                exit_code: status.code().unwrap_or(0),
            })
        } else {
            Err(BuildError::Failed(status.code()))
        }
    }
}
