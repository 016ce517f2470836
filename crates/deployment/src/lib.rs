use std::sync::Arc;

use db::DBService;
use llm::LlmPool;
use services::services::{
    access::AccessResolver,
    ai_update::AiUpdateService,
    blackboard::Blackboard,
    bus::MessageBus,
    config::CoreConfig,
    git::GitService,
    ledger::CostLedger,
    registry::ProjectRegistry,
    sandbox::SandboxSupervisor,
    swarm::AgentDispatcher,
    workflow::WorkflowEngine,
    workspace::WorkspaceManager,
};

/// The explicit dependency bundle: every subsystem is constructed once at
/// startup and threaded through here instead of living in a process-wide
/// mutable registry.
pub trait Deployment: Clone + Send + Sync + 'static {
    fn config(&self) -> &CoreConfig;
    fn db(&self) -> &DBService;
    fn access(&self) -> &AccessResolver;
    fn registry(&self) -> &ProjectRegistry;
    fn git(&self) -> &Arc<GitService>;
    fn sandbox(&self) -> &Arc<SandboxSupervisor>;
    fn workflows(&self) -> &WorkflowEngine;
    fn workspaces(&self) -> &Arc<WorkspaceManager>;
    fn swarm(&self) -> &Arc<dyn AgentDispatcher>;
    fn ai_update(&self) -> &Arc<AiUpdateService>;
    fn llm(&self) -> &Arc<LlmPool>;
    fn bus(&self) -> &MessageBus;
    fn blackboard(&self) -> &Arc<Blackboard>;
    fn ledger(&self) -> &Arc<CostLedger>;
}
