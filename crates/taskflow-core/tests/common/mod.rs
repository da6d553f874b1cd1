//! Shared fixtures for the engine integration tests: an in-memory database,
//! scripted collaborators and a helper to stamp out workflows from YAML.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use taskflow_core::models::Workflow;
use taskflow_core::store::{AgentTaskStore, StepStore, TemplateStore, WorkflowStore};
use taskflow_core::workflow::{
    AgentTaskRunner, RetryPolicy, StepExecutor, TemplateInstantiator, WebhookCaller,
    WebhookRequest, WebhookResponse, WorkflowEngine,
};
use taskflow_core::{Database, EngineError};

/// Records the title of every agent task it runs and echoes it back.
pub struct RecordingAgents {
    tasks: AgentTaskStore,
    pub ran: Mutex<Vec<String>>,
}

impl RecordingAgents {
    pub fn new(db: &Database) -> Self {
        Self {
            tasks: AgentTaskStore::new(db.clone()),
            ran: Mutex::new(Vec::new()),
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentTaskRunner for RecordingAgents {
    async fn run_task(&self, task_id: &str) -> Result<Value, EngineError> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        self.ran.lock().unwrap().push(task.title.clone());
        Ok(json!({"handled": task.title, "input": task.input_data}))
    }
}

/// Fails the first `failures` calls, then answers 200 `{"ok": true}`.
pub struct FlakyWebhooks {
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyWebhooks {
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookCaller for FlakyWebhooks {
    async fn call(&self, _request: WebhookRequest) -> Result<WebhookResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::Internal("connection refused".into()));
        }
        Ok(WebhookResponse {
            status_code: 200,
            body: json!({"ok": true}),
        })
    }
}

pub struct Harness {
    pub db: Database,
    pub engine: Arc<WorkflowEngine>,
    pub instantiator: TemplateInstantiator,
    pub workflows: WorkflowStore,
    pub steps: StepStore,
    pub templates: TemplateStore,
    pub agents: Arc<RecordingAgents>,
    pub webhooks: Arc<FlakyWebhooks>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_webhook_failures(0)
    }

    pub fn with_webhook_failures(failures: u32) -> Self {
        let db = Database::open_in_memory().unwrap();
        let agents = Arc::new(RecordingAgents::new(&db));
        Self::build(db, agents.clone(), agents, failures)
    }

    /// Use `runner` for AGENT_TASK steps instead of the recording fake.
    pub fn with_runner(db: Database, runner: Arc<dyn AgentTaskRunner>) -> Self {
        let agents = Arc::new(RecordingAgents::new(&db));
        Self::build(db, agents, runner, 0)
    }

    fn build(
        db: Database,
        agents: Arc<RecordingAgents>,
        runner: Arc<dyn AgentTaskRunner>,
        webhook_failures: u32,
    ) -> Self {
        let webhooks = Arc::new(FlakyWebhooks::new(webhook_failures));
        let executor = StepExecutor::new(db.clone(), runner, webhooks.clone(), RetryPolicy::immediate());
        Self {
            engine: Arc::new(WorkflowEngine::new(db.clone(), executor)),
            instantiator: TemplateInstantiator::new(db.clone()),
            workflows: WorkflowStore::new(db.clone()),
            steps: StepStore::new(db.clone()),
            templates: TemplateStore::new(db.clone()),
            agents,
            webhooks,
            db,
        }
    }

    /// Import `yaml` as a template and instantiate it for `tester`.
    pub async fn workflow_from_yaml(&self, yaml: &str, input: Value) -> Workflow {
        let template = self.instantiator.import_yaml(yaml, Some("tester")).await.unwrap();
        self.instantiator
            .instantiate(&template.id, "tester", input)
            .await
            .unwrap()
    }

    pub async fn step_named(&self, workflow_id: &str, name: &str) -> taskflow_core::models::WorkflowStep {
        self.steps
            .list_by_workflow(workflow_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no step named {name}"))
    }
}
