//! Step executor: runs a single step according to its type.
//!
//! Each attempt marks the step RUNNING, dispatches on `step_type` and hands
//! the raw result back to the retry controller. [`StepExecutor::execute`]
//! wraps that in retries and records the final state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::agent_task::CreateAgentTaskInput;
use crate::models::step::{StepStatus, StepType, WorkflowStep};
use crate::models::workflow::Workflow;
use crate::store::{AgentTaskStore, StepStore};

use super::agent::AgentTaskRunner;
use super::condition::Condition;
use super::retry::{RetryController, RetryPolicy, StepAttempt};
use super::webhook::{WebhookCaller, WebhookRequest};

pub const DEFAULT_DELAY_SECONDS: u64 = 60;

/// What a step can see of the workflow it runs in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub workflow_input: Value,
    pub created_by: Option<String>,
    /// Fired when the workflow is cancelled; interrupts agent calls, webhooks and delays.
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(workflow: &Workflow, cancel: CancellationToken) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            workflow_input: workflow.input_data.clone(),
            created_by: workflow.created_by.clone(),
            cancel,
        }
    }
}

/// How a step finished.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    /// A CONDITION step evaluated to false; its dependents are to be skipped.
    ConditionFalse(Value),
    /// A HUMAN_APPROVAL step is parked until someone approves or rejects it.
    AwaitingApproval(Value),
}

impl StepOutcome {
    pub fn output(&self) -> &Value {
        match self {
            StepOutcome::Completed(v)
            | StepOutcome::ConditionFalse(v)
            | StepOutcome::AwaitingApproval(v) => v,
        }
    }
}

pub struct StepExecutor {
    steps: StepStore,
    tasks: AgentTaskStore,
    agents: Arc<dyn AgentTaskRunner>,
    webhooks: Arc<dyn WebhookCaller>,
    retry: RetryController,
    default_delay_seconds: u64,
}

impl StepExecutor {
    pub fn new(
        db: Database,
        agents: Arc<dyn AgentTaskRunner>,
        webhooks: Arc<dyn WebhookCaller>,
        policy: RetryPolicy,
    ) -> Self {
        let steps = StepStore::new(db.clone());
        Self {
            retry: RetryController::new(steps.clone(), policy),
            steps,
            tasks: AgentTaskStore::new(db),
            agents,
            webhooks,
            default_delay_seconds: DEFAULT_DELAY_SECONDS,
        }
    }

    /// Delay used by DELAY steps that do not set `delay_seconds`.
    pub fn with_default_delay(mut self, seconds: u64) -> Self {
        self.default_delay_seconds = seconds;
        self
    }

    /// Run `step` with retries and persist its final state.
    ///
    /// On cancellation the step is put back to PENDING so a later run starts it afresh.
    pub async fn execute(
        &self,
        step: &mut WorkflowStep,
        ctx: &StepContext,
    ) -> Result<StepOutcome, EngineError> {
        let output = match self.retry.run_with_retry(step, ctx, self).await {
            Ok(output) => output,
            Err(EngineError::Cancelled(msg)) => {
                step.status = StepStatus::Pending;
                step.started_at = None;
                self.steps.save(step).await?;
                tracing::info!("[Executor] Step '{}' interrupted, back to PENDING", step.name);
                return Err(EngineError::Cancelled(msg));
            }
            Err(e) => return Err(e),
        };

        if step.step_type == StepType::HumanApproval {
            return Ok(StepOutcome::AwaitingApproval(output));
        }

        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        step.output_data = output.clone();
        step.error_message.clear();
        self.steps.save(step).await?;
        tracing::info!("[Executor] Step '{}' completed", step.name);

        if step.step_type == StepType::Condition && output.get("action") == Some(&json!("skip")) {
            return Ok(StepOutcome::ConditionFalse(output));
        }
        Ok(StepOutcome::Completed(output))
    }

    async fn run_agent_task(
        &self,
        step: &mut WorkflowStep,
        ctx: &StepContext,
    ) -> Result<Value, EngineError> {
        let task_id = match &step.agent_task_id {
            Some(id) => id.clone(),
            None => {
                let agent_type = step
                    .config
                    .get("agent_type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let task_data = step.config.get("task_data").cloned().unwrap_or(Value::Null);
                let description = if step.description.is_empty() {
                    step.name.clone()
                } else {
                    step.description.clone()
                };

                let task = self
                    .tasks
                    .create(CreateAgentTaskInput {
                        kind: agent_type,
                        title: step.name.clone(),
                        description,
                        input_data: merge_objects(&[&ctx.workflow_input, &step.input_data, &task_data]),
                        created_by: ctx.created_by.clone(),
                    })
                    .await?;
                step.agent_task_id = Some(task.id.clone());
                self.steps.save(step).await?;
                task.id
            }
        };

        until_cancelled(ctx, &step.name, self.agents.run_task(&task_id)).await
    }

    async fn await_approval(&self, step: &mut WorkflowStep) -> Result<Value, EngineError> {
        step.status = StepStatus::Pending;
        self.steps.save(step).await?;
        tracing::info!("[Executor] Step '{}' awaiting human approval", step.name);
        Ok(json!({
            "status": "pending_approval",
            "message": "Awaiting human approval",
        }))
    }

    async fn call_webhook(&self, step: &WorkflowStep, ctx: &StepContext) -> Result<Value, EngineError> {
        let request = WebhookRequest::from_step_config(&step.config, step.input_data.clone())?;
        let response = until_cancelled(ctx, &step.name, self.webhooks.call(request)).await?;
        Ok(json!({
            "status_code": response.status_code,
            "response": response.body,
        }))
    }

    async fn delay(&self, step: &WorkflowStep, ctx: &StepContext) -> Result<Value, EngineError> {
        let delayed = step
            .config
            .get("delay_seconds")
            .filter(|v| v.is_number())
            .cloned()
            .unwrap_or_else(|| json!(self.default_delay_seconds));
        let seconds = delayed.as_f64().filter(|s| s.is_finite() && *s > 0.0).unwrap_or(0.0);

        if seconds > 0.0 {
            let sleep = async {
                tokio::time::sleep(Duration::from_secs_f64(seconds.min(u32::MAX as f64))).await;
                Ok(())
            };
            until_cancelled(ctx, &step.name, sleep).await?;
        }

        Ok(json!({
            "delayed": delayed,
            "message": format!("Waited for {} seconds", delayed),
        }))
    }
}

#[async_trait]
impl StepAttempt for StepExecutor {
    async fn attempt(&self, step: &mut WorkflowStep, ctx: &StepContext) -> Result<Value, EngineError> {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        self.steps.save(step).await?;

        tracing::info!(
            "[Executor] Executing step '{}' (type: {}, attempt {})",
            step.name,
            step.step_type,
            step.retry_count + 1
        );

        match step.step_type {
            StepType::AgentTask => self.run_agent_task(step, ctx).await,
            StepType::HumanApproval => self.await_approval(step).await,
            StepType::Condition => evaluate_condition(step),
            StepType::Webhook => self.call_webhook(step, ctx).await,
            StepType::Delay => self.delay(step, ctx).await,
            StepType::Parallel => Err(EngineError::UnsupportedStepType(
                step.step_type.as_str().to_string(),
            )),
        }
    }
}

fn evaluate_condition(step: &WorkflowStep) -> Result<Value, EngineError> {
    let source = step
        .config
        .get("condition")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::BadRequest("Condition step requires a 'condition'".to_string()))?;
    let result = Condition::parse(source)?.evaluate(&step.input_data)?;
    Ok(json!({
        "condition": source,
        "result": result,
        "action": if result { "continue" } else { "skip" },
    }))
}

/// Race a suspension point against the workflow's cancellation token.
async fn until_cancelled<T, F>(ctx: &StepContext, step_name: &str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        res = fut => res,
        _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled(format!(
            "Step '{}' cancelled",
            step_name
        ))),
    }
}

/// Shallow merge of JSON objects, later keys win. Non-objects are ignored.
fn merge_objects(parts: &[&Value]) -> Value {
    let mut merged = Map::new();
    for part in parts {
        if let Value::Object(map) = part {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}
