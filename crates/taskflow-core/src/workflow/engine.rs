//! Workflow engine: drives a workflow's steps until it completes, fails,
//! or parks (paused, cancelled, awaiting approval).
//!
//! Every status change goes through a compare-and-swap in the store, so the
//! engine never overwrites a pause or cancel written by someone else. Within a
//! process a per-workflow lease keeps two passes from interleaving.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::step::{StepStatus, WorkflowStep};
use crate::models::workflow::WorkflowStatus;
use crate::store::{StepStore, TransitionPatch, WorkflowStore};

use super::executor::{StepContext, StepExecutor, StepOutcome};
use super::resolver::{dependents_closure, find_cycle, is_eligible, status_map};

/// What a call to [`WorkflowEngine::execute_workflow`] or
/// [`WorkflowEngine::continue_workflow`] achieved.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Step name -> result, for steps run during this call.
    pub results: Map<String, Value>,
    /// Names of steps not yet COMPLETED or SKIPPED.
    pub pending_steps: Vec<String>,
    /// Seconds spent in this call.
    pub execution_time: f64,
}

impl WorkflowRunSummary {
    fn new(
        workflow_id: &str,
        status: WorkflowStatus,
        results: Map<String, Value>,
        steps: &[WorkflowStep],
        started: Instant,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            status,
            results,
            pending_steps: steps
                .iter()
                .filter(|s| !s.status.is_done())
                .map(|s| s.name.clone())
                .collect(),
            execution_time: started.elapsed().as_secs_f64(),
        }
    }
}

/// Result of one workflow in a [`WorkflowEngine::run_pending`] batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub workflow_id: String,
    pub result: Result<WorkflowRunSummary, EngineError>,
}

pub struct WorkflowEngine {
    workflows: WorkflowStore,
    steps: StepStore,
    executor: StepExecutor,
    leases: Mutex<HashSet<String>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowEngine {
    pub fn new(db: Database, executor: StepExecutor) -> Self {
        Self {
            workflows: WorkflowStore::new(db.clone()),
            steps: StepStore::new(db),
            executor,
            leases: Mutex::new(HashSet::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) a workflow and run it as far as it can go.
    ///
    /// PENDING, PAUSED and FAILED workflows may be started. Steps that failed in
    /// an earlier run get a fresh retry budget. `input` replaces the stored input.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Option<Value>,
    ) -> Result<WorkflowRunSummary, EngineError> {
        let _lease = self.lease(workflow_id)?;
        let started = Instant::now();
        let workflow = self.workflows.require(workflow_id).await?;

        let patch = TransitionPatch {
            started_at: Some(Utc::now()),
            input_data: input,
            clear_error: true,
            ..Default::default()
        };
        let moved = self
            .workflows
            .transition(
                workflow_id,
                &[
                    WorkflowStatus::Pending,
                    WorkflowStatus::Paused,
                    WorkflowStatus::Failed,
                ],
                WorkflowStatus::Running,
                patch,
            )
            .await?;
        if !moved {
            let status = self
                .workflows
                .get_status(workflow_id)
                .await?
                .unwrap_or(workflow.status);
            return Err(EngineError::Conflict(format!(
                "Workflow {} is {} and cannot be started",
                workflow_id, status
            )));
        }

        tracing::info!(
            "[Engine] Starting workflow '{}' (ID: {})",
            workflow.name,
            workflow_id
        );

        let reset = self.steps.reset_failed(workflow_id).await?
            + self.steps.reset_interrupted(workflow_id).await?;
        if reset > 0 {
            tracing::info!("[Engine] Reset {} step(s) left over from an earlier run", reset);
        }

        self.drive(workflow_id, started).await
    }

    /// Re-drive a RUNNING workflow, e.g. after an approval or a resume.
    pub async fn continue_workflow(&self, workflow_id: &str) -> Result<WorkflowRunSummary, EngineError> {
        let _lease = self.lease(workflow_id)?;
        let status = self.require_status(workflow_id).await?;
        if status != WorkflowStatus::Running {
            return Err(EngineError::Conflict(format!(
                "Workflow {} is {}, not running",
                workflow_id, status
            )));
        }
        tracing::info!("[Engine] Continuing workflow {}", workflow_id);
        self.drive(workflow_id, Instant::now()).await
    }

    /// RUNNING -> PAUSED. An in-flight step finishes; no further step is dispatched.
    pub async fn pause(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.guarded_transition(
            workflow_id,
            &[WorkflowStatus::Running],
            WorkflowStatus::Paused,
            TransitionPatch::default(),
        )
        .await?;
        tracing::info!("[Engine] Workflow {} paused", workflow_id);
        Ok(())
    }

    /// PAUSED -> RUNNING. Call [`continue_workflow`](Self::continue_workflow) to pick up the remaining steps.
    pub async fn resume(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.guarded_transition(
            workflow_id,
            &[WorkflowStatus::Paused],
            WorkflowStatus::Running,
            TransitionPatch::default(),
        )
        .await?;
        tracing::info!("[Engine] Workflow {} resumed", workflow_id);
        Ok(())
    }

    /// Cancel a workflow that is not already COMPLETED or CANCELLED, interrupting
    /// any step suspended in this process.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.guarded_transition(
            workflow_id,
            &[
                WorkflowStatus::Pending,
                WorkflowStatus::Running,
                WorkflowStatus::Paused,
                WorkflowStatus::Failed,
            ],
            WorkflowStatus::Cancelled,
            TransitionPatch {
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?;

        if let Ok(tokens) = self.tokens.lock() {
            if let Some(token) = tokens.get(workflow_id) {
                token.cancel();
            }
        }
        tracing::info!("[Engine] Workflow {} cancelled", workflow_id);
        Ok(())
    }

    /// Approve a HUMAN_APPROVAL step that is awaiting a decision.
    pub async fn approve_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        actor: &str,
    ) -> Result<WorkflowStep, EngineError> {
        let _lease = self.lease(workflow_id)?;
        let mut step = self.awaiting_step(workflow_id, step_id).await?;

        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        step.output_data = json!({
            "status": "approved",
            "approved_by": actor,
        });
        self.steps.save(&step).await?;
        self.refresh_progress(workflow_id).await?;

        tracing::info!("[Engine] Step '{}' approved by {}", step.name, actor);
        Ok(step)
    }

    /// Reject a HUMAN_APPROVAL step. The step and its workflow become FAILED.
    pub async fn reject_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<WorkflowStep, EngineError> {
        let _lease = self.lease(workflow_id)?;
        let mut step = self.awaiting_step(workflow_id, step_id).await?;

        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("Rejected by {}", actor));
        step.status = StepStatus::Failed;
        step.error_message = reason.clone();
        step.output_data = json!({
            "status": "rejected",
            "rejected_by": actor,
            "reason": reason,
        });
        self.steps.save(&step).await?;

        self.workflows
            .transition(
                workflow_id,
                &[WorkflowStatus::Running, WorkflowStatus::Paused],
                WorkflowStatus::Failed,
                TransitionPatch {
                    error_message: Some(format!("Step '{}' rejected: {}", step.name, reason)),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!("[Engine] Step '{}' rejected by {}", step.name, actor);
        Ok(step)
    }

    /// Execute up to `limit` PENDING workflows concurrently, lowest priority value
    /// first, then oldest.
    pub async fn run_pending(self: &Arc<Self>, limit: u32) -> Result<Vec<BatchOutcome>, EngineError> {
        let runnable = self.workflows.list_runnable(limit).await?;
        tracing::info!("[Engine] Running {} pending workflow(s)", runnable.len());

        let mut join_set = JoinSet::new();
        for workflow in runnable {
            let engine = Arc::clone(self);
            join_set.spawn(async move {
                let result = engine.execute_workflow(&workflow.id, None).await;
                (workflow.id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((workflow_id, result)) => {
                    if let Err(e) = &result {
                        tracing::warn!("[Engine] Workflow {} did not complete: {}", workflow_id, e);
                    }
                    outcomes.push(BatchOutcome { workflow_id, result });
                }
                Err(e) => {
                    tracing::warn!("[Engine] Task join error: {}", e);
                }
            }
        }
        Ok(outcomes)
    }

    async fn drive(&self, workflow_id: &str, started: Instant) -> Result<WorkflowRunSummary, EngineError> {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .map_err(|_| EngineError::Internal("Cancellation table poisoned".to_string()))?
            .insert(workflow_id.to_string(), token.clone());

        let result = self.run_passes(workflow_id, token, started).await;

        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(workflow_id);
        }
        result
    }

    /// Visit PENDING steps in `step_order`, dispatching each eligible one, until a
    /// full pass makes no progress.
    async fn run_passes(
        &self,
        workflow_id: &str,
        token: CancellationToken,
        started: Instant,
    ) -> Result<WorkflowRunSummary, EngineError> {
        let workflow = self.workflows.require(workflow_id).await?;
        let ctx = StepContext::new(&workflow, token);

        let mut steps = self.steps.list_by_workflow(workflow_id).await?;
        let total = steps.len() as u32;
        let mut current = steps.iter().filter(|s| s.status.is_done()).count() as u32;
        self.workflows.update_progress(workflow_id, current, total).await?;

        let mut results = Map::new();
        loop {
            let mut progressed = false;

            for idx in 0..steps.len() {
                if steps[idx].status != StepStatus::Pending || steps[idx].is_awaiting_approval() {
                    continue;
                }
                if !is_eligible(&steps[idx], &status_map(&steps)) {
                    tracing::debug!("[Engine] Waiting for dependencies of step '{}'", steps[idx].name);
                    continue;
                }

                let status = self.require_status(workflow_id).await?;
                if status != WorkflowStatus::Running {
                    tracing::info!(
                        "[Engine] Workflow {} is {}, stopping before step '{}'",
                        workflow_id,
                        status,
                        steps[idx].name
                    );
                    return Ok(WorkflowRunSummary::new(workflow_id, status, results, &steps, started));
                }

                let mut step = steps[idx].clone();
                let outcome = self.executor.execute(&mut step, &ctx).await;
                let name = step.name.clone();
                steps[idx] = step;

                match outcome {
                    Ok(StepOutcome::Completed(output)) => {
                        results.insert(name, output);
                        current += 1;
                    }
                    Ok(StepOutcome::ConditionFalse(output)) => {
                        results.insert(name, output);
                        current += 1;
                        current += self.skip_dependents(idx, &mut steps).await?;
                    }
                    Ok(StepOutcome::AwaitingApproval(output)) => {
                        results.insert(name, output);
                    }
                    Err(EngineError::Cancelled(msg)) => {
                        let status = self
                            .workflows
                            .get_status(workflow_id)
                            .await?
                            .unwrap_or(WorkflowStatus::Cancelled);
                        tracing::info!("[Engine] Workflow {} stopped: {}", workflow_id, msg);
                        return Ok(WorkflowRunSummary::new(workflow_id, status, results, &steps, started));
                    }
                    Err(e) => {
                        tracing::error!("[Engine] Step '{}' failed: {}", name, e);
                        return Err(self.fail(workflow_id, e).await);
                    }
                }

                self.workflows.update_progress(workflow_id, current, total).await?;
                progressed = true;
            }

            if !progressed {
                break;
            }
        }

        self.finish(workflow_id, results, &steps, started).await
    }

    /// Mark every transitive dependent of `steps[idx]` SKIPPED. Returns how many changed.
    async fn skip_dependents(&self, idx: usize, steps: &mut [WorkflowStep]) -> Result<u32, EngineError> {
        let skipped: HashSet<String> = dependents_closure(&steps[idx].id, steps).into_iter().collect();
        let mut count = 0;
        for step in steps.iter_mut() {
            if !skipped.contains(&step.id) || step.status.is_done() {
                continue;
            }
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            self.steps.save(step).await?;
            tracing::info!("[Engine] Step '{}' skipped by condition", step.name);
            count += 1;
        }
        Ok(count)
    }

    async fn finish(
        &self,
        workflow_id: &str,
        results: Map<String, Value>,
        steps: &[WorkflowStep],
        started: Instant,
    ) -> Result<WorkflowRunSummary, EngineError> {
        let remaining: Vec<&WorkflowStep> = steps.iter().filter(|s| !s.status.is_done()).collect();

        if remaining.is_empty() {
            let output: Map<String, Value> = steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed)
                .map(|s| (s.name.clone(), s.output_data.clone()))
                .collect();
            let completed = self
                .workflows
                .transition(
                    workflow_id,
                    &[WorkflowStatus::Running],
                    WorkflowStatus::Completed,
                    TransitionPatch {
                        completed_at: Some(Utc::now()),
                        output_data: Some(Value::Object(output)),
                        ..Default::default()
                    },
                )
                .await?;
            let status = if completed {
                tracing::info!("[Engine] Workflow {} completed successfully", workflow_id);
                WorkflowStatus::Completed
            } else {
                self.require_status(workflow_id).await?
            };
            return Ok(WorkflowRunSummary::new(workflow_id, status, results, steps, started));
        }

        let mut blocked: HashSet<String> = HashSet::new();
        for step in steps.iter().filter(|s| s.is_awaiting_approval()) {
            blocked.insert(step.id.clone());
            blocked.extend(dependents_closure(&step.id, steps));
        }
        let stuck: Vec<&WorkflowStep> = remaining
            .into_iter()
            .filter(|s| !blocked.contains(&s.id))
            .collect();

        if stuck.is_empty() {
            let status = self.require_status(workflow_id).await?;
            tracing::info!("[Engine] Workflow {} waiting for human approval", workflow_id);
            return Ok(WorkflowRunSummary::new(workflow_id, status, results, steps, started));
        }

        let graph: Vec<(String, Vec<String>)> = stuck
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        if let Some(cycle) = find_cycle(&graph) {
            let names: HashMap<&str, &str> =
                steps.iter().map(|s| (s.id.as_str(), s.name.as_str())).collect();
            let cycle: Vec<&str> = cycle
                .iter()
                .map(|id| names.get(id.as_str()).copied().unwrap_or(id.as_str()))
                .collect();
            tracing::warn!("[Engine] Dependency cycle in workflow {}: {}", workflow_id, cycle.join(" -> "));
        }

        let names = stuck.iter().map(|s| s.name.clone()).collect();
        Err(self.fail(workflow_id, EngineError::DependencyStall(names)).await)
    }

    /// Record `err` on the workflow (RUNNING -> FAILED) and hand it back.
    async fn fail(&self, workflow_id: &str, err: EngineError) -> EngineError {
        let message = err.to_string();
        let patch = TransitionPatch {
            error_message: Some(message.clone()),
            ..Default::default()
        };
        match self
            .workflows
            .transition(workflow_id, &[WorkflowStatus::Running], WorkflowStatus::Failed, patch)
            .await
        {
            Ok(true) => tracing::error!("[Engine] Workflow {} failed: {}", workflow_id, message),
            Ok(false) => tracing::warn!(
                "[Engine] Workflow {} left RUNNING before its failure was recorded: {}",
                workflow_id,
                message
            ),
            Err(db) => tracing::error!(
                "[Engine] Could not record failure of workflow {}: {}",
                workflow_id,
                db
            ),
        }
        err
    }

    async fn awaiting_step(&self, workflow_id: &str, step_id: &str) -> Result<WorkflowStep, EngineError> {
        let step = self
            .steps
            .get(step_id)
            .await?
            .filter(|s| s.workflow_id == workflow_id)
            .ok_or_else(|| {
                EngineError::NotFound(format!("Step {} in workflow {}", step_id, workflow_id))
            })?;
        if !step.is_awaiting_approval() {
            return Err(EngineError::Conflict(format!(
                "Step '{}' is not awaiting approval",
                step.name
            )));
        }
        let status = self.require_status(workflow_id).await?;
        if !matches!(status, WorkflowStatus::Running | WorkflowStatus::Paused) {
            return Err(EngineError::Conflict(format!(
                "Workflow {} is {}",
                workflow_id, status
            )));
        }
        Ok(step)
    }

    async fn refresh_progress(&self, workflow_id: &str) -> Result<(), EngineError> {
        let steps = self.steps.list_by_workflow(workflow_id).await?;
        let done = steps.iter().filter(|s| s.status.is_done()).count() as u32;
        self.workflows
            .update_progress(workflow_id, done, steps.len() as u32)
            .await
    }

    async fn guarded_transition(
        &self,
        workflow_id: &str,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
        patch: TransitionPatch,
    ) -> Result<(), EngineError> {
        if self.workflows.transition(workflow_id, from, to, patch).await? {
            return Ok(());
        }
        let current = self.require_status(workflow_id).await?;
        Err(EngineError::Conflict(format!(
            "Cannot move workflow {} from {} to {}",
            workflow_id, current, to
        )))
    }

    async fn require_status(&self, workflow_id: &str) -> Result<WorkflowStatus, EngineError> {
        self.workflows
            .get_status(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {}", workflow_id)))
    }

    /// Per-workflow in-process lease. Held for the whole of a pass; the
    /// entry leaves the table when the guard drops.
    fn lease(&self, workflow_id: &str) -> Result<Lease<'_>, EngineError> {
        let mut held = self
            .leases
            .lock()
            .map_err(|_| EngineError::Internal("Lease table poisoned".to_string()))?;
        if !held.insert(workflow_id.to_string()) {
            return Err(EngineError::Conflict(format!(
                "Workflow {} is already being executed",
                workflow_id
            )));
        }
        Ok(Lease {
            table: &self.leases,
            workflow_id: workflow_id.to_string(),
        })
    }
}

struct Lease<'a> {
    table: &'a Mutex<HashSet<String>>,
    workflow_id: String,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut held = self.table.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.workflow_id);
    }
}
