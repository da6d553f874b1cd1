//! Agent dispatch for AGENT_TASK steps.
//!
//! ```text
//! StepExecutor ──► AgentTaskRunner::run_task(task_id)
//!                        │  (RegistryTaskRunner)
//!                        ▼
//!                  AgentRegistry[kind] ──► AgentHandler::handle(&AgentTask)
//! ```
//!
//! The registry is an explicit map built once at startup and shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::models::agent_task::{AgentTask, AgentTaskStatus};
use crate::store::AgentTaskStore;

/// Runs an agent task to completion and returns its output.
#[async_trait]
pub trait AgentTaskRunner: Send + Sync {
    async fn run_task(&self, task_id: &str) -> Result<Value, EngineError>;
}

/// One kind of agent (triage, review, summarizer, ...).
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, task: &AgentTask) -> Result<Value, EngineError>;
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn AgentHandler>) -> &mut Self {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!("[AgentRegistry] Replaced handler for kind '{}'", kind);
        }
        self
    }

    pub fn with(mut self, kind: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Default [`AgentTaskRunner`]: loads the task record, dispatches to the
/// handler registered for its kind and records the outcome.
pub struct RegistryTaskRunner {
    tasks: AgentTaskStore,
    registry: Arc<AgentRegistry>,
}

impl RegistryTaskRunner {
    pub fn new(tasks: AgentTaskStore, registry: Arc<AgentRegistry>) -> Self {
        Self { tasks, registry }
    }
}

#[async_trait]
impl AgentTaskRunner for RegistryTaskRunner {
    async fn run_task(&self, task_id: &str) -> Result<Value, EngineError> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Agent task {}", task_id)))?;

        if task.status == AgentTaskStatus::Completed {
            tracing::info!("[AgentRunner] Task {} already completed, reusing output", task_id);
            return Ok(task.output_data);
        }

        let kind = task.kind.clone().ok_or_else(|| {
            EngineError::BadRequest(format!("Agent task {} has no agent kind", task_id))
        })?;
        let handler = self.registry.get(&kind).ok_or_else(|| {
            EngineError::BadRequest(format!("No agent registered for kind '{}'", kind))
        })?;

        self.tasks
            .update_status(task_id, AgentTaskStatus::Running, None, None)
            .await?;
        tracing::info!("[AgentRunner] Running task {} with agent '{}'", task_id, kind);

        match handler.handle(&task).await {
            Ok(output) => {
                self.tasks
                    .update_status(task_id, AgentTaskStatus::Completed, Some(output.clone()), None)
                    .await?;
                Ok(output)
            }
            Err(e) => {
                self.tasks
                    .update_status(task_id, AgentTaskStatus::Failed, None, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}

/// Echoes the task back as its output. Handy for dry runs and for wiring up templates
/// before real agents exist.
pub struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn handle(&self, task: &AgentTask) -> Result<Value, EngineError> {
        Ok(serde_json::json!({
            "agent": task.kind,
            "title": task.title,
            "input": task.input_data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::agent_task::CreateAgentTaskInput;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl AgentHandler for Failing {
        async fn handle(&self, _task: &AgentTask) -> Result<Value, EngineError> {
            Err(EngineError::Internal("model unavailable".into()))
        }
    }

    async fn task(tasks: &AgentTaskStore, kind: Option<&str>) -> AgentTask {
        tasks
            .create(CreateAgentTaskInput {
                kind: kind.map(str::to_string),
                title: "Triage".into(),
                description: "Triage the bug".into(),
                input_data: json!({"bug": 7}),
                created_by: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_registered_handler_and_records_output() {
        let tasks = AgentTaskStore::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(AgentRegistry::new().with("echo", Arc::new(EchoAgent)));
        let runner = RegistryTaskRunner::new(tasks.clone(), registry);

        let t = task(&tasks, Some("echo")).await;
        let out = runner.run_task(&t.id).await.unwrap();
        assert_eq!(out["input"]["bug"], 7);

        let stored = tasks.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentTaskStatus::Completed);
        assert_eq!(stored.output_data, out);
    }

    #[tokio::test]
    async fn test_handler_failure_is_recorded() {
        let tasks = AgentTaskStore::new(Database::open_in_memory().unwrap());
        let registry = Arc::new(AgentRegistry::new().with("flaky", Arc::new(Failing)));
        let runner = RegistryTaskRunner::new(tasks.clone(), registry);

        let t = task(&tasks, Some("flaky")).await;
        assert!(runner.run_task(&t.id).await.is_err());
        let stored = tasks.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentTaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("Internal error: model unavailable"));
    }

    #[tokio::test]
    async fn test_unknown_kind_and_missing_task() {
        let tasks = AgentTaskStore::new(Database::open_in_memory().unwrap());
        let runner = RegistryTaskRunner::new(tasks.clone(), Arc::new(AgentRegistry::new()));

        let t = task(&tasks, Some("nobody")).await;
        assert!(matches!(runner.run_task(&t.id).await, Err(EngineError::BadRequest(_))));
        let t = task(&tasks, None).await;
        assert!(matches!(runner.run_task(&t.id).await, Err(EngineError::BadRequest(_))));
        assert!(matches!(runner.run_task("nope").await, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_registry_kinds_sorted() {
        let registry = AgentRegistry::new()
            .with("triage", Arc::new(EchoAgent))
            .with("review", Arc::new(EchoAgent));
        assert_eq!(registry.kinds(), vec!["review", "triage"]);
        assert!(registry.get("triage").is_some());
        assert!(registry.get("deploy").is_none());
    }
}
