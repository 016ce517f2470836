use std::{
    io::Read,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use services::services::sandbox::{
    ExecOutcome, LaunchSpec, LaunchedSandbox, SandboxBackend, SandboxBackendKind, SandboxError,
    SandboxHandle,
};
use tokio::{process::Command, sync::mpsc};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

fn backend_err(err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Backend(err.to_string())
}

/// PTY-backed local process runtime; the fallback when no container
/// runtime is reachable. The project's start command runs under a real
/// pseudo-terminal so interactive dev servers behave as in a terminal.
#[derive(Debug, Clone, Default)]
pub struct PtyBackend;

impl PtyBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for PtyBackend {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalPty
    }

    async fn available(&self) -> bool {
        true
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSandbox, SandboxError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(backend_err)?;

        let mut command = CommandBuilder::new("sh");
        command.arg("-c");
        command.arg(&spec.start_command);
        command.cwd(&spec.workspace);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        // Local processes bind the allocated host port directly.
        command.env("PORT", spec.host_port.to_string());

        let child = pair.slave.spawn_command(command).map_err(backend_err)?;
        let pid = child.process_id();
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader().map_err(backend_err)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            let mut pending = String::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(pos) = pending.find('\n') {
                            let line = pending[..pos].trim_end_matches('\r').to_string();
                            pending.drain(..=pos);
                            if tx.send(line).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            if !pending.is_empty() {
                let _ = tx.send(pending);
            }
        });

        tracing::info!(?pid, command = %spec.start_command, "local PTY sandbox started");
        Ok(LaunchedSandbox {
            handle: Arc::new(PtyHandle {
                pid,
                child: tokio::sync::Mutex::new(child),
                _master: std::sync::Mutex::new(pair.master),
                workspace: spec.workspace.clone(),
                env: spec.env.clone(),
            }),
            output: rx,
        })
    }
}

pub struct PtyHandle {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    /// Keeps the PTY pair open for the lifetime of the sandbox.
    _master: std::sync::Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    workspace: PathBuf,
    env: Vec<(String, String)>,
}

impl PtyHandle {
    async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(Some(_)))
    }
}

#[async_trait]
impl SandboxHandle for PtyHandle {
    fn reference(&self) -> String {
        match self.pid {
            Some(pid) => format!("pty:{pid}"),
            None => "pty".to_string(),
        }
    }

    /// Commands run in the sandbox's working directory with its
    /// environment, not inside the PTY session itself.
    async fn exec(&self, command: &str) -> Result<ExecOutcome, SandboxError> {
        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .envs(self.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout(EXEC_TIMEOUT, shell.output())
            .await
            .map_err(|_| SandboxError::Timeout)?
            .map_err(|err| SandboxError::Backend(format!("exec failed: {err}")))?;
        Ok(ExecOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), SandboxError> {
        if let Some(pid) = self.pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Grace expired; force kill and reap.
        {
            let mut child = self.child.lock().await;
            if let Err(err) = child.kill() {
                tracing::debug!(error = %err, "pty kill after grace failed");
            }
        }
        let force_deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < force_deadline {
            if self.has_exited().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(SandboxError::Backend(
            "pty process did not exit after SIGKILL".to_string(),
        ))
    }

    async fn is_alive(&self) -> bool {
        !self.has_exited().await
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn spec(dir: &std::path::Path, start_command: &str) -> LaunchSpec {
        LaunchSpec {
            project_id: Uuid::new_v4(),
            container_name: "unused".to_string(),
            workspace: dir.to_path_buf(),
            image: "unused".to_string(),
            host_port: 34567,
            internal_port: 3000,
            env: vec![("ORCH_SANDBOX".to_string(), "true".to_string())],
            start_command: start_command.to_string(),
        }
    }

    #[tokio::test]
    async fn captures_output_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let backend = PtyBackend::new();
        let mut launched = backend
            .launch(&spec(dir.path(), "echo pty-says-$ORCH_SANDBOX"))
            .await
            .unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), launched.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.contains("pty-says-true"));

        // A short-lived command exits on its own.
        let deadline = Instant::now() + Duration::from_secs(5);
        while launched.handle.is_alive().await {
            assert!(Instant::now() < deadline, "echo never exited");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn exec_runs_in_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let backend = PtyBackend::new();
        let launched = backend.launch(&spec(dir.path(), "sleep 5")).await.unwrap();

        let outcome = launched.handle.exec("cat marker.txt").await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "here");

        launched
            .handle
            .shutdown(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!launched.handle.is_alive().await);
    }
}
