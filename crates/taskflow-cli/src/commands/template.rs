//! `taskflow template`: Template management commands.

use taskflow_core::models::{TemplateDefinition, WorkflowTemplate};
use taskflow_core::state::AppState;
use taskflow_core::workflow::validate_specs;

use super::print_json;

pub async fn import(state: &AppState, file: &str, created_by: Option<&str>) -> Result<(), String> {
    let template = state
        .instantiator
        .import_file(file, created_by)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "✅ Imported template '{}' ({} step(s))",
        template.name,
        template.step_specs().map(|s| s.len()).unwrap_or(0)
    );
    println!("   ID: {}", template.id);
    Ok(())
}

/// Parse and validate a template file without touching the database.
pub fn validate(file: &str) -> Result<(), String> {
    let definition = TemplateDefinition::from_file(file).map_err(|e| e.to_string())?;
    validate_specs(&definition.steps).map_err(|e| e.to_string())?;

    println!("✅ Template '{}' is valid", definition.name);
    println!("   Type: {}", definition.workflow_type.as_str());
    println!("   Steps: {}", definition.steps.len());
    for (i, step) in definition.steps.iter().enumerate() {
        if step.depends_on.is_empty() {
            println!("   {}. {} ({})", i + 1, step.name, step.step_type.as_str());
        } else {
            println!(
                "   {}. {} ({}) after {}",
                i + 1,
                step.name,
                step.step_type.as_str(),
                step.depends_on.join(", ")
            );
        }
    }
    Ok(())
}

pub async fn list(state: &AppState, active_only: bool) -> Result<(), String> {
    let templates = state
        .template_store
        .list(active_only)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "templates": templates }));
    Ok(())
}

pub async fn get(state: &AppState, id_or_name: &str) -> Result<(), String> {
    let template = find(state, id_or_name).await?;
    print_json(&serde_json::to_value(&template).map_err(|e| e.to_string())?);
    Ok(())
}

pub async fn set_active(state: &AppState, id: &str, active: bool) -> Result<(), String> {
    let found = state
        .template_store
        .set_active(id, active)
        .await
        .map_err(|e| e.to_string())?;
    if !found {
        return Err(format!("Template not found: {}", id));
    }
    println!(
        "Template {} {}",
        id,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}

/// Look a template up by ID first, then by name.
pub(crate) async fn find(state: &AppState, id_or_name: &str) -> Result<WorkflowTemplate, String> {
    if let Some(t) = state
        .template_store
        .get(id_or_name)
        .await
        .map_err(|e| e.to_string())?
    {
        return Ok(t);
    }
    state
        .template_store
        .get_by_name(id_or_name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Template not found: {}", id_or_name))
}
