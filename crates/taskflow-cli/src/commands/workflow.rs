//! `taskflow workflow`: Create, execute and control workflows.

use taskflow_core::models::{WorkflowFilter, WorkflowStatus, WorkflowType};
use taskflow_core::state::AppState;
use taskflow_core::workflow::WorkflowRunSummary;

use super::{parse_json_object, print_json, template};

pub async fn create(
    state: &AppState,
    template_ref: &str,
    actor: &str,
    input: &str,
    priority: Option<i32>,
    run_now: bool,
) -> Result<(), String> {
    let input = parse_json_object(input)?;
    let template = template::find(state, template_ref).await?;
    let workflow = state
        .instantiator
        .instantiate(&template.id, actor, input)
        .await
        .map_err(|e| e.to_string())?;

    if let Some(p) = priority {
        state
            .workflow_store
            .update_priority(&workflow.id, p)
            .await
            .map_err(|e| e.to_string())?;
    }

    println!("✅ Created workflow '{}'", workflow.name);
    println!("   ID: {}", workflow.id);
    println!("   Steps: {}", workflow.total_steps);

    if run_now {
        println!();
        run(state, &workflow.id, None).await?;
    }
    Ok(())
}

pub async fn run(state: &AppState, id: &str, input: Option<&str>) -> Result<(), String> {
    let input = input.map(parse_json_object).transpose()?;
    let summary = state
        .engine
        .execute_workflow(id, input)
        .await
        .map_err(|e| e.to_string())?;
    report(&summary)
}

pub async fn continue_run(state: &AppState, id: &str) -> Result<(), String> {
    let summary = state
        .engine
        .continue_workflow(id)
        .await
        .map_err(|e| e.to_string())?;
    report(&summary)
}

pub async fn pause(state: &AppState, id: &str) -> Result<(), String> {
    state.engine.pause(id).await.map_err(|e| e.to_string())?;
    println!("⏸  Workflow {} paused", id);
    Ok(())
}

pub async fn resume(state: &AppState, id: &str, and_continue: bool) -> Result<(), String> {
    state.engine.resume(id).await.map_err(|e| e.to_string())?;
    println!("▶  Workflow {} resumed", id);
    if and_continue {
        continue_run(state, id).await?;
    }
    Ok(())
}

pub async fn cancel(state: &AppState, id: &str) -> Result<(), String> {
    state.engine.cancel(id).await.map_err(|e| e.to_string())?;
    println!("🛑 Workflow {} cancelled", id);
    Ok(())
}

pub async fn status(state: &AppState, id: &str) -> Result<(), String> {
    let workflow = state
        .workflow_store
        .require(id)
        .await
        .map_err(|e| e.to_string())?;
    let steps = state
        .step_store
        .list_by_workflow(id)
        .await
        .map_err(|e| e.to_string())?;

    let mut value = serde_json::to_value(&workflow).map_err(|e| e.to_string())?;
    value["progressPercentage"] = serde_json::json!(workflow.progress_percentage());
    value["steps"] = serde_json::to_value(&steps).map_err(|e| e.to_string())?;
    print_json(&value);
    Ok(())
}

pub async fn list(
    state: &AppState,
    status: Option<&str>,
    workflow_type: Option<&str>,
    limit: u32,
) -> Result<(), String> {
    let status = status.map(parse_status).transpose()?;
    let filter = WorkflowFilter {
        status,
        workflow_type: workflow_type.map(|t| WorkflowType::from_str(&t.to_uppercase())),
        created_by: None,
        limit: Some(limit),
    };
    let workflows = state
        .workflow_store
        .list(filter)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "workflows": workflows }));
    Ok(())
}

pub async fn run_pending(state: &AppState, limit: u32) -> Result<(), String> {
    let outcomes = state
        .engine
        .run_pending(limit)
        .await
        .map_err(|e| e.to_string())?;
    if outcomes.is_empty() {
        println!("No pending workflows");
        return Ok(());
    }

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(summary) => println!("  {} {}", summary.status, outcome.workflow_id),
            Err(e) => {
                failed += 1;
                println!("  FAILED {} ({})", outcome.workflow_id, e);
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} of {} workflow(s) failed", failed, outcomes.len()));
    }
    Ok(())
}

/// Print a run summary. Only a COMPLETED run is reported with a success banner.
fn report(summary: &WorkflowRunSummary) -> Result<(), String> {
    print_json(&serde_json::to_value(summary).map_err(|e| e.to_string())?);
    match summary.status {
        WorkflowStatus::Completed => println!("\n🎉 Workflow completed successfully!"),
        WorkflowStatus::Running if !summary.pending_steps.is_empty() => println!(
            "\n⏳ Waiting on: {}",
            summary.pending_steps.join(", ")
        ),
        other => println!("\nWorkflow is {}", other),
    }
    Ok(())
}

fn parse_status(raw: &str) -> Result<WorkflowStatus, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_uppercase()))
        .map_err(|_| format!("Unknown workflow status: {}", raw))
}
