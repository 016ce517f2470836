use std::{sync::Arc, time::Duration};

use db::DBService;
use deployment::Deployment;
use llm::{CostSink, LlmClient, LlmPool, ModelCatalog, PoolSettings};
use services::services::{
    access::AccessResolver,
    ai_update::AiUpdateService,
    blackboard::Blackboard,
    build::BuildService,
    bus::MessageBus,
    config::CoreConfig,
    git::GitService,
    ledger::CostLedger,
    registry::ProjectRegistry,
    sandbox::SandboxSupervisor,
    swarm::{AgentDispatcher, SwarmDispatcher},
    workflow::{CoreStepRunner, WorkflowEngine},
    workspace::WorkspaceManager,
};

pub mod container;
pub mod pty;

pub use container::DockerBackend;
pub use pty::PtyBackend;

/// Initializes tracing from `RUST_LOG`, defaulting to info.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

struct Inner {
    config: CoreConfig,
    db: DBService,
    access: AccessResolver,
    registry: ProjectRegistry,
    git: Arc<GitService>,
    sandbox: Arc<SandboxSupervisor>,
    workflows: WorkflowEngine,
    workspaces: Arc<WorkspaceManager>,
    swarm: Arc<dyn AgentDispatcher>,
    ai_update: Arc<AiUpdateService>,
    llm: Arc<LlmPool>,
    bus: MessageBus,
    blackboard: Arc<Blackboard>,
    ledger: Arc<CostLedger>,
}

/// Single-node deployment: every subsystem wired against the local
/// database, the local Docker daemon (with PTY fallback), and one LLM
/// backend endpoint.
#[derive(Clone)]
pub struct LocalDeployment {
    inner: Arc<Inner>,
}

impl LocalDeployment {
    pub async fn new(config: CoreConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root).await?;

        let db = DBService::new().await?;
        let access = AccessResolver::new(db.clone());
        let registry = ProjectRegistry::new(db.clone(), access.clone());

        let ledger = Arc::new(CostLedger::new(db.clone()));
        let sink: Arc<dyn CostSink> = ledger.clone();

        let mut catalog = ModelCatalog::builtin();
        if let Some(primary) = &config.llm_primary_model {
            catalog.promote(config.llm_tier, primary);
        }
        let llm = Arc::new(LlmPool::new(
            LlmClient::new(config.llm_base_url.clone())?,
            catalog,
            PoolSettings {
                tier: config.llm_tier,
                batch_window: config.batch_window(),
                max_batch: config.max_batch,
                call_timeout: Duration::from_secs(120),
            },
            sink.clone(),
        ));
        if let Err(err) = llm.refresh_loaded().await {
            tracing::warn!(error = %err, "could not list backend models, catalog assumes all loaded");
        }

        let blackboard = Arc::new(Blackboard::new());
        let swarm: Arc<dyn AgentDispatcher> = Arc::new(SwarmDispatcher::new(
            llm.clone(),
            blackboard.clone(),
            sink.clone(),
        ));
        let ai_update = Arc::new(AiUpdateService::new(swarm.clone()));

        let git = Arc::new(GitService::new(
            config.git_user_name.clone(),
            config.git_user_email.clone(),
        ));

        let sandbox = Arc::new(SandboxSupervisor::new(
            db.clone(),
            &config,
            Arc::new(DockerBackend::new()),
            Arc::new(PtyBackend::new()),
        ));
        match sandbox.adopt_orphans().await {
            Ok(adopted) if adopted > 0 => {
                tracing::info!(adopted, "adopted orphan sandboxes from a previous run");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "orphan sandbox adoption failed"),
        }

        let bus = MessageBus::new();
        let runner = Arc::new(CoreStepRunner::new(
            git.clone(),
            ai_update.clone(),
            Arc::new(BuildService::new()),
            sandbox.clone(),
        ));
        let workflows = WorkflowEngine::new(
            db.clone(),
            access.clone(),
            runner,
            bus.clone(),
            config.max_wf_concurrency,
        );
        let workspaces = Arc::new(WorkspaceManager::new(db.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                db,
                access,
                registry,
                git,
                sandbox,
                workflows,
                workspaces,
                swarm,
                ai_update,
                llm,
                bus,
                blackboard,
                ledger,
            }),
        })
    }

    /// Stops all sandboxes; call on orderly shutdown.
    pub async fn shutdown(&self) {
        self.inner.sandbox.stop_all().await;
    }
}

impl Deployment for LocalDeployment {
    fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    fn db(&self) -> &DBService {
        &self.inner.db
    }

    fn access(&self) -> &AccessResolver {
        &self.inner.access
    }

    fn registry(&self) -> &ProjectRegistry {
        &self.inner.registry
    }

    fn git(&self) -> &Arc<GitService> {
        &self.inner.git
    }

    fn sandbox(&self) -> &Arc<SandboxSupervisor> {
        &self.inner.sandbox
    }

    fn workflows(&self) -> &WorkflowEngine {
        &self.inner.workflows
    }

    fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.inner.workspaces
    }

    fn swarm(&self) -> &Arc<dyn AgentDispatcher> {
        &self.inner.swarm
    }

    fn ai_update(&self) -> &Arc<AiUpdateService> {
        &self.inner.ai_update
    }

    fn llm(&self) -> &Arc<LlmPool> {
        &self.inner.llm
    }

    fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    fn blackboard(&self) -> &Arc<Blackboard> {
        &self.inner.blackboard
    }

    fn ledger(&self) -> &Arc<CostLedger> {
        &self.inner.ledger
    }
}
