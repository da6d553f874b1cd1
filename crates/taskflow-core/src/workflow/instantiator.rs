//! Stamps out workflows from templates.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::step::WorkflowStep;
use crate::models::template::{StepSpec, TemplateDefinition, WorkflowTemplate};
use crate::models::workflow::Workflow;
use crate::store::step_store::{insert_dependency, insert_step};
use crate::store::template_store::increment_usage;
use crate::store::workflow_store::insert_workflow;
use crate::store::TemplateStore;

use super::resolver::find_cycle;

#[derive(Clone)]
pub struct TemplateInstantiator {
    db: Database,
    templates: TemplateStore,
}

impl TemplateInstantiator {
    pub fn new(db: Database) -> Self {
        Self {
            templates: TemplateStore::new(db.clone()),
            db,
        }
    }

    /// Create a PENDING workflow with one step per spec of the template.
    ///
    /// The workflow, its steps, their dependency edges and the template's usage
    /// count are written in one transaction: either all of it lands or none of it.
    pub async fn instantiate(
        &self,
        template_id: &str,
        actor: &str,
        input_data: Value,
    ) -> Result<Workflow, EngineError> {
        let template = self
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Template {}", template_id)))?;
        if !template.is_active {
            return Err(EngineError::BadRequest(format!(
                "Template '{}' is not active",
                template.name
            )));
        }

        let specs = template.step_specs()?;
        validate_specs(&specs)?;

        let mut workflow = Workflow::new(
            Uuid::new_v4().to_string(),
            format!("{} - {}", template.name, actor),
            template.workflow_type,
            input_data,
        );
        workflow.description = template.description.clone();
        workflow.config = template.template_config.clone();
        workflow.total_steps = specs.len() as u32;
        workflow.created_by = Some(actor.to_string());

        let (steps, edges) = build_steps(&workflow.id, &specs);

        let wf = workflow.clone();
        let template_id = template.id.clone();
        self.db
            .with_transaction_async(move |tx| {
                insert_workflow(tx, &wf)?;
                for step in &steps {
                    insert_step(tx, step)?;
                }
                for (step_id, depends_on_id) in &edges {
                    insert_dependency(tx, step_id, depends_on_id)?;
                }
                increment_usage(tx, &template_id)?;
                Ok(())
            })
            .await?;

        tracing::info!(
            "[Instantiator] Created workflow '{}' ({} steps) from template '{}'",
            workflow.name,
            specs.len(),
            template.name
        );
        Ok(workflow)
    }

    /// Validate and store a template definition, replacing one with the same name.
    pub async fn import(
        &self,
        definition: &TemplateDefinition,
        actor: Option<&str>,
    ) -> Result<WorkflowTemplate, EngineError> {
        validate_specs(&definition.steps)?;
        self.templates.import(definition, actor).await
    }

    pub async fn import_yaml(&self, yaml: &str, actor: Option<&str>) -> Result<WorkflowTemplate, EngineError> {
        self.import(&TemplateDefinition::from_yaml(yaml)?, actor).await
    }

    pub async fn import_file(&self, path: &str, actor: Option<&str>) -> Result<WorkflowTemplate, EngineError> {
        self.import(&TemplateDefinition::from_file(path)?, actor).await
    }
}

/// Step names must be non-empty and unique, dependencies must name steps of the
/// same template, and the dependency graph must be acyclic.
pub fn validate_specs(specs: &[StepSpec]) -> Result<(), EngineError> {
    let mut names = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(EngineError::BadRequest("Step name must not be empty".to_string()));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(EngineError::BadRequest(format!(
                "Duplicate step name '{}'",
                spec.name
            )));
        }
    }
    for spec in specs {
        if let Some(unknown) = spec.depends_on.iter().find(|d| !names.contains(d.as_str())) {
            return Err(EngineError::BadRequest(format!(
                "Step '{}' depends on unknown step '{}'",
                spec.name, unknown
            )));
        }
    }

    let graph: Vec<(String, Vec<String>)> = specs
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.clone()))
        .collect();
    match find_cycle(&graph) {
        Some(cycle) => Err(EngineError::DependencyCycle(cycle)),
        None => Ok(()),
    }
}

/// Steps with `step_order = 0..N-1` and `(step_id, depends_on_id)` edges.
fn build_steps(workflow_id: &str, specs: &[StepSpec]) -> (Vec<WorkflowStep>, Vec<(String, String)>) {
    let steps: Vec<WorkflowStep> = specs
        .iter()
        .enumerate()
        .map(|(order, spec)| {
            let mut step = WorkflowStep::new(
                Uuid::new_v4().to_string(),
                workflow_id.to_string(),
                order as u32,
                spec.name.clone(),
                spec.step_type,
            );
            step.description = spec.description.clone();
            step.config = spec.config.clone();
            step.input_data = spec.input_data.clone();
            step.max_retries = spec.max_retries;
            step
        })
        .collect();

    let ids: HashMap<&str, &str> = steps
        .iter()
        .map(|s| (s.name.as_str(), s.id.as_str()))
        .collect();
    let mut edges = Vec::new();
    for (spec, step) in specs.iter().zip(&steps) {
        for dep in &spec.depends_on {
            if let Some(dep_id) = ids.get(dep.as_str()) {
                edges.push((step.id.clone(), dep_id.to_string()));
            }
        }
    }
    (steps, edges)
}
