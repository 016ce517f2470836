use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::{DBService, models::project::Project};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use ts_rs::TS;
use utils::msg_store::MsgStore;
use uuid::Uuid;

use super::{config::CoreConfig, error::ErrorKind, stack};

const LOG_TAIL_CAPACITY: usize = 10_000;
/// Failed entries stay observable for this long before being reaped.
const FAILED_REAP: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no active sandbox for project {0}")]
    NotRunning(Uuid),
    #[error("sandbox already running for project {0}")]
    AlreadyRunning(Uuid),
    #[error("project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sandbox backend error: {0}")]
    Backend(String),
    #[error("sandbox operation timed out")]
    Timeout,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::NotRunning(_) => ErrorKind::Precondition,
            SandboxError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            SandboxError::ProjectNotFound(_) => ErrorKind::NotFound,
            SandboxError::Timeout => ErrorKind::Timeout,
            SandboxError::Backend(_) => ErrorKind::External,
            SandboxError::Database(_) | SandboxError::Io(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxBackendKind {
    Container,
    LocalPty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxState {
    /// States counted against the one-active-sandbox-per-project rule.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SandboxState::Provisioning | SandboxState::Running | SandboxState::Stopping
        )
    }
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct SandboxInfo {
    pub id: Uuid,
    pub project_id: Uuid,
    pub backend: SandboxBackendKind,
    pub image_or_shell: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub state: SandboxState,
    #[ts(type = "Date")]
    pub started_at: DateTime<Utc>,
    pub log_file: String,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project_id: Uuid,
    pub container_name: String,
    pub workspace: PathBuf,
    pub image: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub env: Vec<(String, String)>,
    pub start_command: String,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct OrphanSandbox {
    pub reference: String,
    pub project_id: Option<Uuid>,
    pub host_port: Option<u16>,
}

/// A freshly launched (or adopted) sandbox: the control handle plus the
/// one-shot output feed.
pub struct LaunchedSandbox {
    pub handle: Arc<dyn SandboxHandle>,
    pub output: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> SandboxBackendKind;
    async fn available(&self) -> bool;
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSandbox, SandboxError>;
    /// Leftover sandboxes from a previous supervisor run.
    async fn list_orphans(&self) -> Result<Vec<OrphanSandbox>, SandboxError> {
        Ok(Vec::new())
    }
    async fn adopt(&self, _orphan: &OrphanSandbox) -> Result<Option<LaunchedSandbox>, SandboxError> {
        Ok(None)
    }
    async fn remove_orphan(&self, _orphan: &OrphanSandbox) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Container id or process description.
    fn reference(&self) -> String;
    async fn exec(&self, command: &str) -> Result<ExecOutcome, SandboxError>;
    /// Polite termination, force kill after `grace`; resolves once gone.
    async fn shutdown(&self, grace: Duration) -> Result<(), SandboxError>;
    async fn is_alive(&self) -> bool;
}

struct ActiveSandbox {
    info: RwLock<SandboxInfo>,
    handle: Option<Arc<dyn SandboxHandle>>,
    store: Arc<MsgStore<String>>,
}

impl ActiveSandbox {
    fn state(&self) -> SandboxState {
        self.info.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn set_state(&self, state: SandboxState) -> SandboxInfo {
        let mut info = self.info.write().unwrap_or_else(PoisonError::into_inner);
        info.state = state;
        info.clone()
    }

    fn snapshot(&self) -> SandboxInfo {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

type Index = Arc<DashMap<Uuid, Arc<ActiveSandbox>>>;

/// Allocates, monitors, and tears down per-project runtime environments.
///
/// Every running sandbox lives in exactly one of two indexes, container- or
/// PTY-backed. At most one sandbox per project is active at any time; the
/// per-project lock is held across start and stop.
pub struct SandboxSupervisor {
    db: DBService,
    storage_root: PathBuf,
    grace: Duration,
    container: Arc<dyn SandboxBackend>,
    pty: Arc<dyn SandboxBackend>,
    container_index: Index,
    pty_index: Index,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    held_ports: Arc<DashMap<u16, Uuid>>,
}

fn spawn_output_pump(
    mut output: mpsc::UnboundedReceiver<String>,
    store: Arc<MsgStore<String>>,
    log_file: PathBuf,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .await
        {
            Ok(file) => Some(file),
            Err(err) => {
                tracing::warn!(error = %err, "failed to open sandbox log file");
                None
            }
        };
        while let Some(line) = output.recv().await {
            if let Some(file) = file.as_mut() {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            store.push(line);
        }
        store.finish();
    });
}

impl SandboxSupervisor {
    pub fn new(
        db: DBService,
        config: &CoreConfig,
        container: Arc<dyn SandboxBackend>,
        pty: Arc<dyn SandboxBackend>,
    ) -> Self {
        Self {
            db,
            storage_root: config.storage_root.clone(),
            grace: config.grace(),
            container,
            pty,
            container_index: Arc::new(DashMap::new()),
            pty_index: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            held_ports: Arc::new(DashMap::new()),
        }
    }

    fn project_lock(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn index_for(&self, kind: SandboxBackendKind) -> &Index {
        match kind {
            SandboxBackendKind::Container => &self.container_index,
            SandboxBackendKind::LocalPty => &self.pty_index,
        }
    }

    fn find_entry(&self, project_id: Uuid) -> Option<(SandboxBackendKind, Arc<ActiveSandbox>)> {
        if let Some(entry) = self.container_index.get(&project_id) {
            return Some((SandboxBackendKind::Container, entry.value().clone()));
        }
        self.pty_index
            .get(&project_id)
            .map(|entry| (SandboxBackendKind::LocalPty, entry.value().clone()))
    }

    fn remove_entry(&self, project_id: Uuid, kind: SandboxBackendKind) {
        if let Some((_, entry)) = self.index_for(kind).remove(&project_id) {
            let port = entry.snapshot().host_port;
            self.held_ports.remove(&port);
        }
    }

    fn spawn_failed_reaper(&self, project_id: Uuid, kind: SandboxBackendKind) {
        let index = self.index_for(kind).clone();
        let held_ports = self.held_ports.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FAILED_REAP).await;
            let reap = index
                .get(&project_id)
                .map(|entry| entry.state() == SandboxState::Failed)
                .unwrap_or(false);
            if reap {
                if let Some((_, entry)) = index.remove(&project_id) {
                    held_ports.remove(&entry.snapshot().host_port);
                }
            }
        });
    }

    pub fn info(&self, project_id: Uuid) -> Option<SandboxInfo> {
        self.find_entry(project_id).map(|(_, entry)| entry.snapshot())
    }

    /// Starts a sandbox for the project. Fails with ALREADY_RUNNING when an
    /// active sandbox exists; falls back to the local PTY backend when the
    /// container runtime is unavailable.
    pub async fn start(&self, project_id: Uuid) -> Result<SandboxInfo, SandboxError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if let Some((kind, entry)) = self.find_entry(project_id) {
            if entry.state().is_active() {
                return Err(SandboxError::AlreadyRunning(project_id));
            }
            // Terminal leftovers (failed/stopped) make way for a new start.
            self.remove_entry(project_id, kind);
        }

        let project = Project::find_by_id(&self.db.pool, project_id)
            .await?
            .ok_or(SandboxError::ProjectNotFound(project_id))?;
        let workspace = PathBuf::from(&project.local_path);
        tokio::fs::create_dir_all(&workspace).await?;

        let profile = stack::resolve(&project.language, project.framework.as_deref());
        let start_command = stack::detect_start_command(&workspace, &profile);

        // Allocate the host port by binding port 0 and reading it back; the
        // bind is held until just before the backend takes the port over.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        let host_port = listener.local_addr()?.port();

        let backend = if self.container.available().await {
            self.container.clone()
        } else {
            tracing::warn!(%project_id, "container backend unavailable, falling back to local PTY");
            self.pty.clone()
        };

        let log_dir = workspace.join(".sandbox");
        tokio::fs::create_dir_all(&log_dir).await?;
        let log_file = log_dir.join("app.log");
        tokio::fs::write(&log_file, b"").await?;

        let mut env = vec![
            ("ORCH_SANDBOX".to_string(), "true".to_string()),
            ("PROJECT_ID".to_string(), project_id.to_string()),
        ];
        env.extend(
            profile
                .env
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );

        let spec = LaunchSpec {
            project_id,
            container_name: format!("orch-sandbox-{project_id}"),
            workspace,
            image: profile.image.to_string(),
            host_port,
            internal_port: profile.internal_port,
            env,
            start_command,
        };

        let info = SandboxInfo {
            id: Uuid::new_v4(),
            project_id,
            backend: backend.kind(),
            image_or_shell: match backend.kind() {
                SandboxBackendKind::Container => spec.image.clone(),
                SandboxBackendKind::LocalPty => spec.start_command.clone(),
            },
            host_port,
            internal_port: spec.internal_port,
            state: SandboxState::Provisioning,
            started_at: Utc::now(),
            log_file: log_file.display().to_string(),
        };

        drop(listener);
        match backend.launch(&spec).await {
            Ok(launched) => {
                let store = Arc::new(MsgStore::with_capacity(LOG_TAIL_CAPACITY));
                spawn_output_pump(launched.output, store.clone(), log_file);

                let entry = Arc::new(ActiveSandbox {
                    info: RwLock::new(info),
                    handle: Some(launched.handle),
                    store,
                });
                let running = entry.set_state(SandboxState::Running);
                self.index_for(backend.kind()).insert(project_id, entry);
                self.held_ports.insert(host_port, project_id);
                tracing::info!(
                    %project_id,
                    backend = ?backend.kind(),
                    host_port,
                    "sandbox started"
                );
                Ok(running)
            }
            Err(err) => {
                tracing::error!(%project_id, error = %err, "sandbox launch failed");
                let entry = Arc::new(ActiveSandbox {
                    info: RwLock::new(info),
                    handle: None,
                    store: Arc::new(MsgStore::with_capacity(1)),
                });
                entry.set_state(SandboxState::Failed);
                self.index_for(backend.kind()).insert(project_id, entry);
                self.spawn_failed_reaper(project_id, backend.kind());
                Err(err)
            }
        }
    }

    /// Polite stop with a grace window, then force kill. Stopping a project
    /// without an active sandbox is a no-op that reports NOT_RUNNING.
    pub async fn stop(&self, project_id: Uuid) -> Result<SandboxInfo, SandboxError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let Some((kind, entry)) = self.find_entry(project_id) else {
            return Err(SandboxError::NotRunning(project_id));
        };
        if !entry.state().is_active() {
            return Err(SandboxError::NotRunning(project_id));
        }

        entry.set_state(SandboxState::Stopping);
        if let Some(handle) = &entry.handle {
            if let Err(err) = handle.shutdown(self.grace).await {
                tracing::warn!(%project_id, error = %err, "sandbox shutdown reported an error");
            }
        }
        let info = entry.set_state(SandboxState::Stopped);
        entry.store.finish();
        self.remove_entry(project_id, kind);
        tracing::info!(%project_id, "sandbox stopped");
        Ok(info)
    }

    pub async fn exec(
        &self,
        project_id: Uuid,
        command: &str,
    ) -> Result<ExecOutcome, SandboxError> {
        let Some((_, entry)) = self.find_entry(project_id) else {
            return Err(SandboxError::NotRunning(project_id));
        };
        if entry.state() != SandboxState::Running {
            return Err(SandboxError::NotRunning(project_id));
        }
        let handle = entry
            .handle
            .clone()
            .ok_or(SandboxError::NotRunning(project_id))?;
        handle.exec(command).await
    }

    /// Last `n` captured lines, stdout and stderr interleaved in capture
    /// order.
    pub fn logs(&self, project_id: Uuid, n: usize) -> Result<Vec<String>, SandboxError> {
        let Some((_, entry)) = self.find_entry(project_id) else {
            return Err(SandboxError::NotRunning(project_id));
        };
        Ok(entry.store.tail(n))
    }

    /// Live log stream from "now"; history is not replayed.
    pub fn stream_logs(&self, project_id: Uuid) -> Result<BoxStream<'static, String>, SandboxError> {
        let Some((_, entry)) = self.find_entry(project_id) else {
            return Err(SandboxError::NotRunning(project_id));
        };
        Ok(entry.store.live_stream())
    }

    /// Adopts labeled containers left over from a previous run when their
    /// project still exists; removes the rest.
    pub async fn adopt_orphans(&self) -> Result<usize, SandboxError> {
        let mut adopted = 0;
        for orphan in self.container.list_orphans().await? {
            let Some(project_id) = orphan.project_id else {
                let _ = self.container.remove_orphan(&orphan).await;
                continue;
            };
            if self.find_entry(project_id).is_some() {
                continue;
            }
            let project = Project::find_by_id(&self.db.pool, project_id).await?;
            let Some(project) = project else {
                tracing::info!(reference = %orphan.reference, "removing orphan sandbox without project");
                let _ = self.container.remove_orphan(&orphan).await;
                continue;
            };

            match self.container.adopt(&orphan).await {
                Ok(Some(launched)) => {
                    let log_file = PathBuf::from(&project.local_path)
                        .join(".sandbox")
                        .join("app.log");
                    let store = Arc::new(MsgStore::with_capacity(LOG_TAIL_CAPACITY));
                    spawn_output_pump(launched.output, store.clone(), log_file.clone());
                    let host_port = orphan.host_port.unwrap_or_default();
                    let entry = Arc::new(ActiveSandbox {
                        info: RwLock::new(SandboxInfo {
                            id: Uuid::new_v4(),
                            project_id,
                            backend: SandboxBackendKind::Container,
                            image_or_shell: orphan.reference.clone(),
                            host_port,
                            internal_port: 0,
                            state: SandboxState::Running,
                            started_at: Utc::now(),
                            log_file: log_file.display().to_string(),
                        }),
                        handle: Some(launched.handle),
                        store,
                    });
                    self.container_index.insert(project_id, entry);
                    if host_port != 0 {
                        self.held_ports.insert(host_port, project_id);
                    }
                    adopted += 1;
                    tracing::info!(%project_id, reference = %orphan.reference, "adopted orphan sandbox");
                }
                Ok(None) => {
                    let _ = self.container.remove_orphan(&orphan).await;
                }
                Err(err) => {
                    tracing::warn!(reference = %orphan.reference, error = %err, "orphan adoption failed");
                }
            }
        }
        Ok(adopted)
    }

    /// Stops every active sandbox; used at shutdown.
    pub async fn stop_all(&self) {
        let project_ids: Vec<Uuid> = self
            .container_index
            .iter()
            .chain(self.pty_index.iter())
            .map(|entry| *entry.key())
            .collect();
        for project_id in project_ids {
            if let Err(err) = self.stop(project_id).await {
                tracing::debug!(%project_id, error = %err, "stop_all skipped sandbox");
            }
        }
    }

    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use db::models::{
        identity::{Role, Tenant, User},
        project::CreateProject,
    };
    use futures::StreamExt;

    use super::*;

    struct FakeHandle {
        alive: AtomicBool,
    }

    #[async_trait]
    impl SandboxHandle for FakeHandle {
        fn reference(&self) -> String {
            "fake".to_string()
        }

        async fn exec(&self, command: &str) -> Result<ExecOutcome, SandboxError> {
            Ok(ExecOutcome {
                exit_code: 0,
                stdout: format!("ran: {command}"),
                stderr: String::new(),
            })
        }

        async fn shutdown(&self, _grace: Duration) -> Result<(), SandboxError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct FakeBackend {
        kind: SandboxBackendKind,
        available: AtomicBool,
        fail_launch: AtomicBool,
    }

    impl FakeBackend {
        fn new(kind: SandboxBackendKind, available: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(available),
                fail_launch: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SandboxBackend for FakeBackend {
        fn kind(&self) -> SandboxBackendKind {
            self.kind
        }

        async fn available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSandbox, SandboxError> {
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(SandboxError::Backend("launch refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(format!("starting {}", spec.start_command));
            let _ = tx.send("listening".to_string());
            // tx kept alive by leaking into the handle's lifetime via spawn
            tokio::spawn(async move {
                // hold the sender briefly so the pump stays open
                tokio::time::sleep(Duration::from_millis(200)).await;
                drop(tx);
            });
            Ok(LaunchedSandbox {
                handle: Arc::new(FakeHandle {
                    alive: AtomicBool::new(true),
                }),
                output: rx,
            })
        }
    }

    async fn fixture(container_available: bool) -> (SandboxSupervisor, Uuid, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DBService::new_in_memory().await.unwrap();
        let tenant = Tenant::create(&db.pool, Uuid::new_v4(), "acme")
            .await
            .unwrap();
        let user = User::create(&db.pool, Uuid::new_v4(), tenant.id, "u@acme.dev", Role::Dev)
            .await
            .unwrap();
        let project = Project::create(
            &db.pool,
            &CreateProject {
                owner_user_id: user.id,
                name: "p1".to_string(),
                language: "node".to_string(),
                framework: None,
                local_path: dir.path().join("p1").display().to_string(),
                remote_url: None,
                branch: None,
                protected: None,
            },
            tenant.id,
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        let config = CoreConfig {
            storage_root: dir.path().to_path_buf(),
            grace_ms: 100,
            ..Default::default()
        };
        let supervisor = SandboxSupervisor::new(
            db,
            &config,
            FakeBackend::new(SandboxBackendKind::Container, container_available),
            FakeBackend::new(SandboxBackendKind::LocalPty, true),
        );
        (supervisor, project.id, dir)
    }

    #[tokio::test]
    async fn second_start_reports_already_running() {
        let (supervisor, project_id, _dir) = fixture(true).await;

        let first = supervisor.start(project_id).await.unwrap();
        assert_eq!(first.state, SandboxState::Running);
        assert_eq!(first.backend, SandboxBackendKind::Container);
        assert!(first.host_port > 0);

        let err = supervisor.start(project_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyRunning(_)));
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

        // Still exactly one indexed sandbox.
        assert_eq!(supervisor.container_index.len(), 1);
        assert_eq!(supervisor.pty_index.len(), 0);
    }

    #[tokio::test]
    async fn start_stop_roundtrip_clears_indexes() {
        let (supervisor, project_id, _dir) = fixture(true).await;

        supervisor.start(project_id).await.unwrap();
        let stopped = supervisor.stop(project_id).await.unwrap();
        assert_eq!(stopped.state, SandboxState::Stopped);
        assert!(supervisor.info(project_id).is_none());

        // Stop without an active sandbox is a NOT_RUNNING no-op.
        let err = supervisor.stop(project_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning(_)));
        assert_eq!(supervisor.container_index.len(), 0);
        assert_eq!(supervisor.pty_index.len(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_pty_when_container_unavailable() {
        let (supervisor, project_id, _dir) = fixture(false).await;

        let info = supervisor.start(project_id).await.unwrap();
        assert_eq!(info.backend, SandboxBackendKind::LocalPty);
        assert_eq!(supervisor.pty_index.len(), 1);
        assert_eq!(supervisor.container_index.len(), 0);
    }

    #[tokio::test]
    async fn logs_and_live_stream() {
        let (supervisor, project_id, _dir) = fixture(true).await;
        supervisor.start(project_id).await.unwrap();

        // Give the pump a moment to drain the scripted lines.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tail = supervisor.logs(project_id, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1], "listening");

        let mut live = supervisor.stream_logs(project_id).unwrap();
        supervisor.stop(project_id).await.unwrap();
        // Stream terminates once the sandbox is gone; no history replayed.
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), live.next())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn exec_requires_running_sandbox() {
        let (supervisor, project_id, _dir) = fixture(true).await;

        let err = supervisor.exec(project_id, "ls").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotRunning(_)));

        supervisor.start(project_id).await.unwrap();
        let outcome = supervisor.exec(project_id, "ls").await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "ran: ls");
    }

    #[tokio::test]
    async fn failed_launch_leaves_a_terminal_entry_and_allows_restart() {
        let (supervisor, project_id, _dir) = fixture(true).await;
        let container = FakeBackend::new(SandboxBackendKind::Container, true);
        container.fail_launch.store(true, Ordering::SeqCst);
        let supervisor = SandboxSupervisor {
            container: container.clone(),
            ..supervisor
        };

        let err = supervisor.start(project_id).await.unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)));
        assert_eq!(
            supervisor.info(project_id).map(|i| i.state),
            Some(SandboxState::Failed)
        );

        // A failed entry does not block a new start.
        container.fail_launch.store(false, Ordering::SeqCst);
        let info = supervisor.start(project_id).await.unwrap();
        assert_eq!(info.state, SandboxState::Running);
    }
}
