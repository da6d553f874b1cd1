//! Shared application state: one database, its stores and a wired-up engine.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::store::{AgentTaskStore, StepStore, TemplateStore, WorkflowStore};
use crate::workflow::{
    AgentRegistry, HttpWebhookCaller, RegistryTaskRunner, StepExecutor, TemplateInstantiator,
    WorkflowEngine,
};

/// Shared state accessible by every command or handler.
pub struct AppStateInner {
    pub db: Database,
    pub config: EngineConfig,
    pub workflow_store: WorkflowStore,
    pub step_store: StepStore,
    pub template_store: TemplateStore,
    pub agent_task_store: AgentTaskStore,
    pub agent_registry: Arc<AgentRegistry>,
    pub instantiator: TemplateInstantiator,
    pub engine: Arc<WorkflowEngine>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire the default collaborators: registry-backed agent runner and HTTP webhooks.
    pub fn new(db: Database, config: EngineConfig, agent_registry: AgentRegistry) -> Self {
        let agent_registry = Arc::new(agent_registry);
        let agent_task_store = AgentTaskStore::new(db.clone());
        let runner = RegistryTaskRunner::new(agent_task_store.clone(), agent_registry.clone());
        let executor = StepExecutor::new(
            db.clone(),
            Arc::new(runner),
            Arc::new(HttpWebhookCaller::new(config.webhook_timeout)),
            config.retry,
        )
        .with_default_delay(config.default_delay_seconds);

        Self {
            workflow_store: WorkflowStore::new(db.clone()),
            step_store: StepStore::new(db.clone()),
            template_store: TemplateStore::new(db.clone()),
            instantiator: TemplateInstantiator::new(db.clone()),
            engine: Arc::new(WorkflowEngine::new(db.clone(), executor)),
            agent_task_store,
            agent_registry,
            config,
            db,
        }
    }
}

/// Open the database named by `config` and build the state around it.
pub fn create_app_state(config: EngineConfig, agent_registry: AgentRegistry) -> Result<AppState, String> {
    let db = Database::open(&config.db_path)
        .map_err(|e| format!("Failed to open database: {}", e))?;
    tracing::info!(
        "Taskflow state ready ({} agent kind(s) registered)",
        agent_registry.kinds().len()
    );
    Ok(Arc::new(AppStateInner::new(db, config, agent_registry)))
}
