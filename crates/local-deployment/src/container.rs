use std::{ffi::OsStr, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use services::services::sandbox::{
    ExecOutcome, LaunchSpec, LaunchedSandbox, OrphanSandbox, SandboxBackend, SandboxBackendKind,
    SandboxError, SandboxHandle,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use uuid::Uuid;

const DOCKER_OP_TIMEOUT: Duration = Duration::from_secs(120);
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

pub const SANDBOX_LABEL: &str = "type=ai-orchestrator-sandbox";

/// Thin wrapper around the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    async fn run<I, S>(args: I) -> Result<String, SandboxError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new("docker");
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(DOCKER_OP_TIMEOUT, command.output())
            .await
            .map_err(|_| SandboxError::Timeout)?
            .map_err(|err| SandboxError::Backend(format!("docker not runnable: {err}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

fn spawn_log_follower(container_id: &str) -> Result<mpsc::UnboundedReceiver<String>, SandboxError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut child = Command::new("docker")
        .args(["logs", "-f", container_id])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| SandboxError::Backend(format!("docker logs failed: {err}")))?;

    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    // Reap the follower when the container exits.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(rx)
}

/// Container-backed sandbox runtime over the Docker Engine, driven through
/// its CLI. Containers carry the orchestrator labels so leftovers can be
/// recognized and adopted on restart.
#[derive(Debug, Clone, Default)]
pub struct DockerBackend;

impl DockerBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Container
    }

    async fn available(&self) -> bool {
        DockerCli::run(["version", "--format", "{{.Server.Version}}"])
            .await
            .is_ok()
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSandbox, SandboxError> {
        // A stale container with this name would shadow the new one.
        let _ = DockerCli::run(["rm", "-f", spec.container_name.as_str()]).await;

        let workspace = spec
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| spec.workspace.clone());

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
            "--label".to_string(),
            SANDBOX_LABEL.to_string(),
            "--label".to_string(),
            format!("project_id={}", spec.project_id),
            "-v".to_string(),
            format!("{}:/workspace", workspace.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            "-p".to_string(),
            format!("{}:{}", spec.host_port, spec.internal_port),
        ];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.start_command.clone());

        let container_id = DockerCli::run(&args).await?;
        tracing::info!(
            container = %container_id,
            image = %spec.image,
            "sandbox container started"
        );

        let output = spawn_log_follower(&container_id)?;
        Ok(LaunchedSandbox {
            handle: Arc::new(DockerHandle { id: container_id }),
            output,
        })
    }

    async fn list_orphans(&self) -> Result<Vec<OrphanSandbox>, SandboxError> {
        let label_filter = format!("label={SANDBOX_LABEL}");
        let listing = DockerCli::run([
            "ps",
            "-a",
            "--filter",
            label_filter.as_str(),
            "--format",
            "{{.ID}}\t{{.Label \"project_id\"}}",
        ])
        .await?;
        Ok(listing
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let mut parts = line.splitn(2, '\t');
                let reference = parts.next().unwrap_or_default().trim().to_string();
                let project_id = parts
                    .next()
                    .and_then(|raw| Uuid::parse_str(raw.trim()).ok());
                OrphanSandbox {
                    reference,
                    project_id,
                    host_port: None,
                }
            })
            .collect())
    }

    async fn adopt(&self, orphan: &OrphanSandbox) -> Result<Option<LaunchedSandbox>, SandboxError> {
        // `docker start` is a no-op for running containers.
        DockerCli::run(["start", orphan.reference.as_str()]).await?;
        let output = spawn_log_follower(&orphan.reference)?;
        Ok(Some(LaunchedSandbox {
            handle: Arc::new(DockerHandle {
                id: orphan.reference.clone(),
            }),
            output,
        }))
    }

    async fn remove_orphan(&self, orphan: &OrphanSandbox) -> Result<(), SandboxError> {
        DockerCli::run(["rm", "-f", orphan.reference.as_str()]).await?;
        Ok(())
    }
}

pub struct DockerHandle {
    id: String,
}

#[async_trait]
impl SandboxHandle for DockerHandle {
    fn reference(&self) -> String {
        self.id.clone()
    }

    async fn exec(&self, command: &str) -> Result<ExecOutcome, SandboxError> {
        let mut docker = Command::new("docker");
        docker
            .args(["exec", &self.id, "sh", "-c", command])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(EXEC_TIMEOUT, docker.output())
            .await
            .map_err(|_| SandboxError::Timeout)?
            .map_err(|err| SandboxError::Backend(format!("docker exec failed: {err}")))?;
        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), SandboxError> {
        // `docker stop` waits for the grace window, then sends SIGKILL.
        let grace_secs = grace.as_secs().max(1).to_string();
        DockerCli::run(["stop", "-t", grace_secs.as_str(), self.id.as_str()]).await?;
        let _ = DockerCli::run(["rm", self.id.as_str()]).await;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        DockerCli::run(["inspect", "--format", "{{.State.Running}}", self.id.as_str()])
            .await
            .map(|state| state == "true")
            .unwrap_or(false)
    }
}
