use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use llm::{Capability, CostDraft, CostSink, GenerationParams, LlmError, LlmPool};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use super::{blackboard::Blackboard, error::ErrorKind};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, TS,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Generate,
    Migrate,
    Fix,
    Analyze,
    Refactor,
    Explain,
    Test,
    Doc,
    Audit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct TaskContext {
    /// Shapes the decomposition (`code_update`, `migration`,
    /// `security_audit`, `inline_edit`, ...).
    pub context_type: Option<String>,
    pub project_path: Option<String>,
    /// Caller-fixed model; wins over routing when set.
    pub model: Option<String>,
    pub params: Option<GenerationParams>,
    #[ts(type = "unknown")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AgentTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub prompt: String,
    pub context: TaskContext,
}

impl AgentTask {
    pub fn new(kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            prompt: prompt.into(),
            context: TaskContext::default(),
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }
}

/// One node of a decomposition. Dependencies are by node name; independent
/// nodes run concurrently, dependents wait for their inputs.
#[derive(Debug, Clone, Serialize, TS)]
pub struct SubTask {
    pub name: String,
    pub capability: Capability,
    pub depends_on: Vec<String>,
    pub instruction: String,
}

fn node(
    name: &str,
    capability: Capability,
    depends_on: &[&str],
    instruction: &str,
) -> SubTask {
    SubTask {
        name: name.to_string(),
        capability,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        instruction: instruction.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct WorkerResult {
    pub node: String,
    pub model: String,
    pub output: String,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct SwarmOutcome {
    pub solution: String,
    pub worker_results: Vec<WorkerResult>,
    pub decomposition: Vec<SubTask>,
}

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("no models available for tier")]
    NoModels,
    #[error("decomposition has unsatisfiable dependencies")]
    BadPlan,
}

impl SwarmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwarmError::Llm(LlmError::Timeout) => ErrorKind::Timeout,
            SwarmError::Llm(_) => ErrorKind::External,
            SwarmError::NoModels | SwarmError::BadPlan => ErrorKind::Precondition,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, TS)]
pub struct SwarmMetrics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// The seam the AI-update service and the workflow engine talk to; tests
/// substitute a scripted dispatcher.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn act(&self, task: &AgentTask) -> Result<SwarmOutcome, SwarmError>;
}

/// Translates a task into model calls: plan, route, fan out, aggregate.
pub struct SwarmDispatcher {
    pool: Arc<LlmPool>,
    blackboard: Arc<Blackboard>,
    sink: Arc<dyn CostSink>,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Decomposition rule set, keyed on the context type first, then the task
/// kind.
fn plan(task: &AgentTask) -> Vec<SubTask> {
    let context_type = task.context.context_type.as_deref();
    if matches!(context_type, Some("migration")) || task.kind == TaskKind::Migrate {
        return vec![
            node(
                "analyze-source",
                Capability::Reasoning,
                &[],
                "Analyze the source project: structure, dependencies, and the behavior that must be preserved.",
            ),
            node(
                "transform",
                Capability::Code,
                &["analyze-source"],
                "Transform the code for the target as requested. Emit complete files as `FILE: <relpath>` headers followed by fenced content.",
            ),
            node(
                "heal",
                Capability::Code,
                &["transform"],
                "Review the transformed output and repair anything broken or incomplete. Emit corrected files in the same FILE-block format.",
            ),
        ];
    }
    if matches!(context_type, Some("security_audit")) || task.kind == TaskKind::Audit {
        return vec![node(
            "audit",
            Capability::Reasoning,
            &[],
            "Audit the project for security and correctness issues; report findings with severity and location.",
        )];
    }
    if matches!(context_type, Some("inline_edit")) {
        return vec![node(
            "edit",
            Capability::Code,
            &[],
            "Edit the given file as requested and return the complete updated file in a single fenced code block.",
        )];
    }
    match task.kind {
        TaskKind::Analyze | TaskKind::Explain => vec![node(
            "analyze",
            Capability::Reasoning,
            &[],
            "Analyze the task input and explain what it does and why.",
        )],
        _ => vec![
            node(
                "analyze",
                Capability::Reasoning,
                &[],
                "Identify which files must change and what the change entails. Be concrete and brief.",
            ),
            node(
                "generate",
                Capability::Code,
                &["analyze"],
                "Produce the changed files. Emit each as a `FILE: <relpath>` header followed by the complete content in a fenced code block.",
            ),
            node(
                "verify",
                Capability::Code,
                &["generate"],
                "Check the generated files for syntax errors and unmet requirements; re-emit any file that needs fixing in the same FILE-block format.",
            ),
        ],
    }
}

fn node_prompt(task: &AgentTask, sub: &SubTask, upstream: &[(String, String)]) -> String {
    let mut prompt = String::new();
    prompt.push_str(&sub.instruction);
    prompt.push_str("\n\n## Task\n");
    prompt.push_str(&task.prompt);
    if let Some(path) = &task.context.project_path {
        prompt.push_str("\n\n## Project path\n");
        prompt.push_str(path);
    }
    if let Some(extra) = &task.context.extra {
        prompt.push_str("\n\n## Context\n");
        prompt.push_str(&extra.to_string());
    }
    for (name, output) in upstream {
        prompt.push_str(&format!("\n\n## Output of {name}\n{output}"));
    }
    prompt
}

impl SwarmDispatcher {
    pub fn new(pool: Arc<LlmPool>, blackboard: Arc<Blackboard>, sink: Arc<dyn CostSink>) -> Self {
        Self {
            pool,
            blackboard,
            sink,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> SwarmMetrics {
        SwarmMetrics {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn route(&self, sub: &SubTask, task: &AgentTask) -> Result<(String, GenerationParams), SwarmError> {
        let params = match &task.context.params {
            Some(params) => params.clone(),
            None => GenerationParams {
                temperature: if sub.capability == Capability::Code {
                    0.2
                } else {
                    0.7
                },
                ..Default::default()
            },
        };
        if let Some(fixed) = &task.context.model {
            return Ok((fixed.clone(), params));
        }
        let tier = self.pool.tier();
        let catalog = self.pool.catalog();
        let catalog = catalog.read().unwrap_or_else(PoisonError::into_inner);
        let model = catalog
            .first_loaded_with(tier, sub.capability)
            .or_else(|| catalog.primary(tier))
            .ok_or(SwarmError::NoModels)?;
        Ok((model.id, params))
    }

    fn fallback_for(&self, failed_model: &str) -> Option<String> {
        let tier = self.pool.tier();
        let catalog = self.pool.catalog();
        let catalog = catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog
            .next_same_family(tier, failed_model)
            .map(|m| m.id)
            .or_else(|| {
                catalog
                    .primary(tier)
                    .map(|m| m.id)
                    .filter(|id| id != failed_model)
            })
    }

    async fn run_node(
        &self,
        task: &AgentTask,
        sub: &SubTask,
        upstream: &[(String, String)],
    ) -> Result<WorkerResult, SwarmError> {
        let (model, params) = self.route(sub, task)?;
        let prompt = node_prompt(task, sub, upstream);

        match self
            .pool
            .generate(prompt.clone(), Some(model.clone()), params.clone())
            .await
        {
            Ok(output) => Ok(WorkerResult {
                node: sub.name.clone(),
                model,
                output,
                fallback_used: false,
            }),
            Err(primary_err) => {
                tracing::warn!(
                    node = %sub.name,
                    model,
                    error = %primary_err,
                    "swarm node failed, trying fallback model"
                );
                let Some(fallback) = self.fallback_for(&model) else {
                    return Err(primary_err.into());
                };
                let output = self
                    .pool
                    .generate(prompt, Some(fallback.clone()), params)
                    .await?;
                Ok(WorkerResult {
                    node: sub.name.clone(),
                    model: fallback,
                    output,
                    fallback_used: true,
                })
            }
        }
    }

    async fn act_inner(&self, task: &AgentTask) -> Result<SwarmOutcome, SwarmError> {
        let decomposition = plan(task);
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut results: Vec<WorkerResult> = Vec::new();

        let mut remaining = decomposition.clone();
        while !remaining.is_empty() {
            let (ready, rest): (Vec<SubTask>, Vec<SubTask>) = remaining
                .into_iter()
                .partition(|sub| sub.depends_on.iter().all(|dep| outputs.contains_key(dep)));
            if ready.is_empty() {
                return Err(SwarmError::BadPlan);
            }
            remaining = rest;

            let wave = futures::future::join_all(ready.iter().map(|sub| {
                let upstream: Vec<(String, String)> = sub
                    .depends_on
                    .iter()
                    .filter_map(|dep| outputs.get(dep).map(|o| (dep.clone(), o.clone())))
                    .collect();
                async move { self.run_node(task, sub, &upstream).await }
            }))
            .await;

            for result in wave {
                let worker = result?;
                self.blackboard
                    .write(
                        format!("swarm:{}:{}", task.id, worker.node),
                        serde_json::Value::String(worker.output.clone()),
                        worker.node.clone(),
                    )
                    .await;
                outputs.insert(worker.node.clone(), worker.output.clone());
                results.push(worker);
            }
        }

        // Aggregation follows plan order, not completion order.
        let solution = if decomposition.len() == 1 {
            outputs
                .get(&decomposition[0].name)
                .cloned()
                .unwrap_or_default()
        } else {
            decomposition
                .iter()
                .filter_map(|sub| {
                    outputs
                        .get(&sub.name)
                        .map(|output| format!("### {}\n{output}", sub.name))
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        Ok(SwarmOutcome {
            solution,
            worker_results: results,
            decomposition,
        })
    }
}

#[async_trait]
impl AgentDispatcher for SwarmDispatcher {
    async fn act(&self, task: &AgentTask) -> Result<SwarmOutcome, SwarmError> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.act_inner(task).await;

        let (failed, nodes) = match &result {
            Ok(outcome) => (false, outcome.worker_results.len()),
            Err(_) => (true, 0),
        };
        self.sink
            .record(CostDraft {
                operation: "swarm.act".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                tokens_in: 0,
                tokens_out: 0,
                virtual_cost_usd: 0.0,
                metadata: serde_json::json!({
                    "task_id": task.id,
                    "kind": task.kind.to_string(),
                    "nodes": nodes,
                    "failed": failed,
                }),
            })
            .await;
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
