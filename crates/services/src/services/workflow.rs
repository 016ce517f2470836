use std::{path::PathBuf, str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use db::{
    DBService,
    models::{
        project::{Project, ProjectStatus},
        workflow::{StepName, StepState, StepStatus, Workflow, WorkflowStatus},
    },
};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use ts_rs::TS;
use utils::{log_msg::LogChunk, msg_store::MsgStore};
use uuid::Uuid;

use super::{
    access::{AccessResolver, Identity, Operation},
    ai_update::{AiUpdateOutcome, AiUpdateService},
    build::BuildService,
    bus::MessageBus,
    error::{CoreError, ErrorKind},
    git::GitService,
    sandbox::{SandboxError, SandboxSupervisor},
};

/// Per-workflow knobs carried from submission to the steps that consume
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct WorkflowConfig {
    pub update_prompt: Option<String>,
    pub commit_message: Option<String>,
    #[ts(type = "unknown")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a step implementation gets to work with.
pub struct StepContext {
    pub workflow_id: Uuid,
    pub project: Project,
    pub config: WorkflowConfig,
    pub logs: Arc<MsgStore<LogChunk>>,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn log(&self, step: StepName, line: impl Into<String>) {
        self.logs.push(LogChunk::now(step.to_string(), line));
    }
}

/// The seam between the engine and its collaborators; production wires
/// git/AI/build/sandbox, tests script it.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        step: StepName,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepFailure>;
}

#[derive(Clone)]
struct WorkflowRuntime {
    cancel: CancellationToken,
    logs: Arc<MsgStore<LogChunk>>,
    config: WorkflowConfig,
}

struct EngineInner {
    db: DBService,
    access: AccessResolver,
    runner: Arc<dyn StepRunner>,
    bus: MessageBus,
    runtimes: DashMap<Uuid, WorkflowRuntime>,
    project_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// Drives ordered multi-step jobs against projects.
///
/// One FIFO queue per node, bounded concurrency, and strict serialization
/// of workflows per project. Steps execute in declared order; the first
/// failure ends the workflow with no compensation.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
    queue: mpsc::UnboundedSender<Uuid>,
}

impl WorkflowEngine {
    pub fn new(
        db: DBService,
        access: AccessResolver,
        runner: Arc<dyn StepRunner>,
        bus: MessageBus,
        max_concurrency: usize,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            db,
            access,
            runner,
            bus,
            runtimes: DashMap::new(),
            project_locks: DashMap::new(),
        });
        let (queue, mut rx) = mpsc::unbounded_channel::<Uuid>();
        let scheduler = inner.clone();
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        tokio::spawn(async move {
            while let Some(workflow_id) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let engine = scheduler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    engine.run_workflow(workflow_id).await;
                });
            }
        });
        Self { inner, queue }
    }

    /// Validates and enqueues a workflow; returns immediately with its id.
    /// An empty step list completes the workflow on the spot.
    pub async fn submit(
        &self,
        project_id: Uuid,
        caller: &Identity,
        steps: &[String],
        config: WorkflowConfig,
    ) -> Result<Uuid, CoreError> {
        let mut parsed = Vec::with_capacity(steps.len());
        for raw in steps {
            let step = StepName::from_str(raw).map_err(|_| {
                CoreError::precondition(format!("INVALID_STEP: unknown step '{raw}'"))
            })?;
            parsed.push(step);
        }

        let project = Project::find_by_id(&self.inner.db.pool, project_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found(format!("project {project_id}")))?;
        if project.status != ProjectStatus::Active {
            return Err(CoreError::precondition(format!(
                "project {project_id} is {}",
                project.status
            )));
        }
        self.inner
            .access
            .authorize(caller, &project, Operation::Write)
            .map_err(CoreError::from)?;

        let workflow = Workflow::create(
            &self.inner.db.pool,
            Uuid::new_v4(),
            project_id,
            caller.user_id,
            &parsed,
        )
        .await
        .map_err(CoreError::from)?;

        let runtime = WorkflowRuntime {
            cancel: CancellationToken::new(),
            logs: Arc::new(MsgStore::new()),
            config,
        };
        self.inner.runtimes.insert(workflow.id, runtime.clone());

        if parsed.is_empty() {
            Workflow::mark_started(&self.inner.db.pool, workflow.id)
                .await
                .map_err(CoreError::from)?;
            Workflow::mark_terminal(
                &self.inner.db.pool,
                workflow.id,
                WorkflowStatus::Completed,
                None,
            )
            .await
            .map_err(CoreError::from)?;
            runtime.logs.finish();
            self.inner
                .publish_terminal(workflow.id, project_id, WorkflowStatus::Completed, None)
                .await;
            return Ok(workflow.id);
        }

        self.queue
            .send(workflow.id)
            .map_err(|_| CoreError::internal("workflow scheduler stopped"))?;
        Ok(workflow.id)
    }

    pub async fn get(&self, caller: &Identity, workflow_id: Uuid) -> Result<Workflow, CoreError> {
        let workflow = Workflow::find_by_id(&self.inner.db.pool, workflow_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found(format!("workflow {workflow_id}")))?;
        let project = Project::find_by_id(&self.inner.db.pool, workflow.project_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found(format!("project {}", workflow.project_id)))?;
        self.inner
            .access
            .authorize(caller, &project, Operation::Read)
            .map_err(CoreError::from)?;
        Ok(workflow)
    }

    /// Non-blocking cancellation. Terminal workflows are untouched and
    /// report their current status; a queued workflow finalizes right away,
    /// a running one is signalled and settles through its current step.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<WorkflowStatus, CoreError> {
        let workflow = Workflow::find_by_id(&self.inner.db.pool, workflow_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found(format!("workflow {workflow_id}")))?;
        if workflow.status.is_terminal() {
            return Ok(workflow.status);
        }

        if let Some(runtime) = self.inner.runtimes.get(&workflow_id) {
            runtime.cancel.cancel();
        }

        if workflow.status == WorkflowStatus::Pending {
            // Not picked up yet; the pending-only guard loses the race
            // gracefully if the scheduler got there first.
            let finalized = Workflow::mark_cancelled_if_pending(&self.inner.db.pool, workflow_id)
                .await
                .map_err(CoreError::from)?;
            if finalized {
                let mut steps = workflow.steps.0.clone();
                for step in &mut steps {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Skipped;
                    }
                }
                let _ = Workflow::update_steps(&self.inner.db.pool, workflow_id, &steps).await;
                if let Some(runtime) = self.inner.runtimes.get(&workflow_id) {
                    runtime.logs.finish();
                }
                self.inner
                    .publish_terminal(
                        workflow_id,
                        workflow.project_id,
                        WorkflowStatus::Cancelled,
                        Some(ErrorKind::Cancelled),
                    )
                    .await;
                return Ok(WorkflowStatus::Cancelled);
            }
        }

        let current = Workflow::find_by_id(&self.inner.db.pool, workflow_id)
            .await
            .map_err(CoreError::from)?
            .map(|w| w.status)
            .unwrap_or(WorkflowStatus::Cancelled);
        Ok(current)
    }

    /// Restartable log chunk stream: history, then live appends until the
    /// workflow finishes.
    pub async fn logs(
        &self,
        workflow_id: Uuid,
    ) -> Result<BoxStream<'static, LogChunk>, CoreError> {
        Workflow::find_by_id(&self.inner.db.pool, workflow_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found(format!("workflow {workflow_id}")))?;
        match self.inner.runtimes.get(&workflow_id) {
            Some(runtime) => Ok(runtime.logs.history_plus_stream()),
            // Chunks are in-memory only; after an engine restart the
            // history of old workflows is gone.
            None => Ok(futures::stream::empty().boxed()),
        }
    }
}

impl EngineInner {
    async fn publish_terminal(
        &self,
        workflow_id: Uuid,
        project_id: Uuid,
        status: WorkflowStatus,
        error_kind: Option<ErrorKind>,
    ) {
        let topic = match status {
            WorkflowStatus::Failed => "workflow:failed",
            WorkflowStatus::Cancelled => "workflow:cancelled",
            _ => "workflow:completed",
        };
        self.bus
            .publish(
                topic,
                serde_json::json!({
                    "workflow_id": workflow_id,
                    "project_id": project_id,
                    "status": status,
                    "error_kind": error_kind.map(|k| k.to_string()),
                }),
            )
            .await;
    }

    async fn run_workflow(self: &Arc<Self>, workflow_id: Uuid) {
        let workflow = match Workflow::find_by_id(&self.db.pool, workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(%workflow_id, error = %err, "failed to load workflow");
                return;
            }
        };
        if workflow.status != WorkflowStatus::Pending {
            return;
        }

        let project = match Project::find_by_id(&self.db.pool, workflow.project_id).await {
            Ok(Some(project)) => project,
            _ => {
                let _ = Workflow::mark_terminal(
                    &self.db.pool,
                    workflow_id,
                    WorkflowStatus::Failed,
                    Some(&ErrorKind::NotFound.to_string()),
                )
                .await;
                return;
            }
        };

        // Workflows for the same project are strictly serialized.
        let lock = self
            .project_locks
            .entry(workflow.project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        let started = Workflow::mark_started(&self.db.pool, workflow_id)
            .await
            .unwrap_or(false);
        if !started {
            // Cancelled while queued.
            return;
        }

        let runtime = self
            .runtimes
            .get(&workflow_id)
            .map(|r| r.clone())
            .unwrap_or_else(|| WorkflowRuntime {
                cancel: CancellationToken::new(),
                logs: Arc::new(MsgStore::new()),
                config: WorkflowConfig::default(),
            });

        let ctx = StepContext {
            workflow_id,
            project: project.clone(),
            config: runtime.config.clone(),
            logs: runtime.logs.clone(),
            cancel: runtime.cancel.clone(),
        };

        let mut steps: Vec<StepState> = workflow.steps.0.clone();
        let mut status = WorkflowStatus::Completed;
        let mut error_kind: Option<ErrorKind> = None;

        for index in 0..steps.len() {
            if runtime.cancel.is_cancelled() {
                skip_from(&mut steps, index);
                status = WorkflowStatus::Cancelled;
                error_kind = Some(ErrorKind::Cancelled);
                break;
            }

            steps[index].status = StepStatus::Running;
            steps[index].started_at = Some(Utc::now());
            self.persist_steps(workflow_id, &steps).await;
            let name = steps[index].name;
            ctx.log(name, format!("starting {name}"));

            let result = self.runner.run_step(name, &ctx).await;
            steps[index].finished_at = Some(Utc::now());
            let cancel_requested = runtime.cancel.is_cancelled();

            match result {
                // A cancel that lands mid-step wins over whatever the step
                // returned; non-interruptible steps ran to completion first.
                _ if cancel_requested => {
                    steps[index].status = StepStatus::Cancelled;
                    steps[index].error_kind = Some(ErrorKind::Cancelled.to_string());
                    ctx.log(name, format!("{name} cancelled"));
                    skip_from(&mut steps, index + 1);
                    status = WorkflowStatus::Cancelled;
                    error_kind = Some(ErrorKind::Cancelled);
                    break;
                }
                Ok(value) => {
                    steps[index].status = StepStatus::Completed;
                    steps[index].result = Some(value);
                    ctx.log(name, format!("{name} completed"));
                }
                Err(failure) if failure.kind == ErrorKind::Cancelled => {
                    steps[index].status = StepStatus::Cancelled;
                    steps[index].error_kind = Some(failure.kind.to_string());
                    ctx.log(name, format!("{name} cancelled"));
                    skip_from(&mut steps, index + 1);
                    status = WorkflowStatus::Cancelled;
                    error_kind = Some(ErrorKind::Cancelled);
                    break;
                }
                Err(failure) => {
                    steps[index].status = StepStatus::Failed;
                    steps[index].error_kind = Some(failure.kind.to_string());
                    ctx.log(name, format!("{name} failed: {}", failure.message));
                    skip_from(&mut steps, index + 1);
                    status = WorkflowStatus::Failed;
                    error_kind = Some(failure.kind);
                    break;
                }
            }
            self.persist_steps(workflow_id, &steps).await;
        }

        self.persist_steps(workflow_id, &steps).await;
        let _ = Workflow::mark_terminal(
            &self.db.pool,
            workflow_id,
            status,
            error_kind.map(|k| k.to_string()).as_deref(),
        )
        .await;
        runtime.logs.finish();
        self.publish_terminal(workflow_id, workflow.project_id, status, error_kind)
            .await;
        tracing::info!(%workflow_id, ?status, "workflow finished");
    }

    async fn persist_steps(&self, workflow_id: Uuid, steps: &[StepState]) {
        if let Err(err) = Workflow::update_steps(&self.db.pool, workflow_id, steps).await {
            tracing::error!(%workflow_id, error = %err, "failed to persist step states");
        }
    }
}

fn skip_from(steps: &mut [StepState], from: usize) {
    for step in steps.iter_mut().skip(from) {
        if step.status == StepStatus::Pending {
            step.status = StepStatus::Skipped;
        }
    }
}

/// Production step dispatch: each step name maps to exactly one
/// collaborator call.
pub struct CoreStepRunner {
    git: Arc<GitService>,
    ai_update: Arc<AiUpdateService>,
    build: Arc<BuildService>,
    sandbox: Arc<SandboxSupervisor>,
}

impl CoreStepRunner {
    pub fn new(
        git: Arc<GitService>,
        ai_update: Arc<AiUpdateService>,
        build: Arc<BuildService>,
        sandbox: Arc<SandboxSupervisor>,
    ) -> Self {
        Self {
            git,
            ai_update,
            build,
            sandbox,
        }
    }
}

#[async_trait]
impl StepRunner for CoreStepRunner {
    async fn run_step(
        &self,
        step: StepName,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepFailure> {
        let workspace = PathBuf::from(&ctx.project.local_path);
        match step {
            StepName::Sync => {
                let head = self
                    .git
                    .pull(&workspace)
                    .await
                    .map_err(|err| StepFailure::new(err.kind(), err.to_string()))?;
                Ok(serde_json::json!({ "commit": head.oid, "branch": head.branch }))
            }
            StepName::AiUpdate => {
                let prompt = ctx.config.update_prompt.clone().ok_or_else(|| {
                    StepFailure::new(ErrorKind::Precondition, "ai_update requires update_prompt")
                })?;
                match self
                    .ai_update
                    .apply_chat(ctx.project.id, &workspace, &prompt, ctx.config.context.clone())
                    .await
                {
                    AiUpdateOutcome::Ok { summary, files } => Ok(serde_json::json!({
                        "summary": summary,
                        "files": files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
                    })),
                    AiUpdateOutcome::Failed { kind, message, .. } => {
                        Err(StepFailure::new(kind, message))
                    }
                }
            }
            StepName::Push => {
                let message = ctx
                    .config
                    .commit_message
                    .clone()
                    .unwrap_or_else(|| "Updated by AI Orchestrator".to_string());
                let outcome = self
                    .git
                    .commit_and_push(&workspace, &ctx.project.branch, &message)
                    .await
                    .map_err(|err| StepFailure::new(err.kind(), err.to_string()))?;
                Ok(serde_json::json!({
                    "commit": outcome.commit_hash,
                    "pushed": outcome.pushed,
                }))
            }
            StepName::Build => {
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                let logs = ctx.logs.clone();
                tokio::spawn(async move {
                    while let Some(line) = rx.recv().await {
                        logs.push(LogChunk::now(StepName::Build.to_string(), line));
                    }
                });
                let outcome = self
                    .build
                    .build(
                        &workspace,
                        &ctx.project.language,
                        ctx.project.framework.as_deref(),
                        tx,
                        &ctx.cancel,
                    )
                    .await
                    .map_err(|err| StepFailure::new(err.kind(), err.to_string()))?;
                Ok(serde_json::json!({
                    "command": outcome.command,
                    "exit_code": outcome.exit_code,
                }))
            }
            StepName::Run => {
                let info = self
                    .sandbox
                    .start(ctx.project.id)
                    .await
                    .map_err(|err| StepFailure::new(err.kind(), err.to_string()))?;
                serde_json::to_value(&info)
                    .map_err(|err| StepFailure::new(ErrorKind::Internal, err.to_string()))
            }
            StepName::Stop => match self.sandbox.stop(ctx.project.id).await {
                Ok(info) => serde_json::to_value(&info)
                    .map_err(|err| StepFailure::new(ErrorKind::Internal, err.to_string())),
                // Stopping an already-stopped project is idempotent.
                Err(SandboxError::NotRunning(_)) => {
                    Ok(serde_json::json!({ "stopped": false, "reason": "not_running" }))
                }
                Err(err) => Err(StepFailure::new(err.kind(), err.to_string())),
            },
        }
    }
}
