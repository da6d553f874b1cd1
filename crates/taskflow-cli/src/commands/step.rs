//! `taskflow step`: Human approval decisions.

use taskflow_core::models::WorkflowStep;
use taskflow_core::state::AppState;

use super::workflow;

pub async fn approve(
    state: &AppState,
    workflow_id: &str,
    step_ref: &str,
    actor: &str,
    and_continue: bool,
) -> Result<(), String> {
    let step = find(state, workflow_id, step_ref).await?;
    state
        .engine
        .approve_step(workflow_id, &step.id, actor)
        .await
        .map_err(|e| e.to_string())?;
    println!("✅ Step '{}' approved by {}", step.name, actor);

    if and_continue {
        println!();
        workflow::continue_run(state, workflow_id).await?;
    }
    Ok(())
}

pub async fn reject(
    state: &AppState,
    workflow_id: &str,
    step_ref: &str,
    actor: &str,
    reason: Option<&str>,
) -> Result<(), String> {
    let step = find(state, workflow_id, step_ref).await?;
    let step = state
        .engine
        .reject_step(workflow_id, &step.id, actor, reason)
        .await
        .map_err(|e| e.to_string())?;
    println!("❌ Step '{}' rejected by {}: {}", step.name, actor, step.error_message);
    Ok(())
}

/// Match a step of the workflow by ID, falling back to its name.
async fn find(state: &AppState, workflow_id: &str, step_ref: &str) -> Result<WorkflowStep, String> {
    let steps = state
        .step_store
        .list_by_workflow(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    steps
        .iter()
        .find(|s| s.id == step_ref)
        .or_else(|| steps.iter().find(|s| s.name == step_ref))
        .cloned()
        .ok_or_else(|| format!("No step '{}' in workflow {}", step_ref, workflow_id))
}
