use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::step::{CreateStepInput, StepStatus, StepType, WorkflowStep, DEFAULT_MAX_RETRIES};

use super::{json_or_empty, ms_to_dt, opt_ms_to_dt};

const STEP_COLUMNS: &str = "id, workflow_id, step_order, name, description, step_type, status, \
     config, input_data, output_data, agent_task_id, retry_count, max_retries, error_message, \
     created_at, updated_at, started_at, completed_at";

#[derive(Clone)]
pub struct StepStore {
    db: Database,
}

impl StepStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a step to a workflow by hand. Its `step_order` is the next free slot and
    /// every dependency must be a step of the same workflow.
    pub async fn create(
        &self,
        workflow_id: &str,
        input: CreateStepInput,
    ) -> Result<WorkflowStep, EngineError> {
        let workflow_id = workflow_id.to_string();
        let created = self
            .db
            .with_transaction_async(move |tx| {
                let next_order: u32 = tx.query_row(
                    "SELECT COALESCE(MAX(step_order) + 1, 0) FROM workflow_steps WHERE workflow_id = ?1",
                    rusqlite::params![workflow_id],
                    |row| row.get(0),
                )?;
                for dep in &input.depends_on {
                    let owner: Option<String> = tx
                        .query_row(
                            "SELECT workflow_id FROM workflow_steps WHERE id = ?1",
                            rusqlite::params![dep],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if owner.as_deref() != Some(workflow_id.as_str()) {
                        return Ok(Err(dep.clone()));
                    }
                }

                let mut step = WorkflowStep::new(
                    Uuid::new_v4().to_string(),
                    workflow_id.clone(),
                    next_order,
                    input.name,
                    input.step_type,
                );
                step.description = input.description;
                step.config = input.config;
                step.input_data = input.input_data;
                step.max_retries = input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
                step.depends_on = input.depends_on;

                insert_step(tx, &step)?;
                for dep in &step.depends_on {
                    insert_dependency(tx, &step.id, dep)?;
                }
                Ok(Ok(step))
            })
            .await?;
        created.map_err(|dep| {
            EngineError::BadRequest(format!(
                "Dependency {} is not a step of the same workflow",
                dep
            ))
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowStep>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let step = conn
                    .query_row(
                        &format!("SELECT {} FROM workflow_steps WHERE id = ?1", STEP_COLUMNS),
                        rusqlite::params![id],
                        |row| Ok(row_to_step(row)),
                    )
                    .optional()?;
                match step {
                    Some(mut step) => {
                        step.depends_on = load_dependencies(conn, &step.id)?;
                        Ok(Some(step))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// All steps of a workflow ordered by `step_order`, with `depends_on` populated.
    pub async fn list_by_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, EngineError> {
        let workflow_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order ASC",
                    STEP_COLUMNS
                ))?;
                let mut steps = stmt
                    .query_map(rusqlite::params![workflow_id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut edges = conn.prepare(
                    "SELECT d.step_id, d.depends_on_id FROM workflow_step_deps d
                     JOIN workflow_steps s ON s.id = d.step_id
                     WHERE s.workflow_id = ?1",
                )?;
                let mut deps: HashMap<String, Vec<String>> = HashMap::new();
                for edge in edges.query_map(rusqlite::params![workflow_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })? {
                    let (step_id, dep_id) = edge?;
                    deps.entry(step_id).or_default().push(dep_id);
                }
                for step in &mut steps {
                    step.depends_on = deps.remove(&step.id).unwrap_or_default();
                    step.depends_on.sort();
                }
                Ok(steps)
            })
            .await
    }

    /// Persist the mutable fields of a step. `step_order` and `workflow_id` never change.
    pub async fn save(&self, step: &WorkflowStep) -> Result<(), EngineError> {
        let s = step.clone();
        let now = Utc::now().timestamp_millis();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_steps SET
                       name = ?2, description = ?3, status = ?4, config = ?5, input_data = ?6,
                       output_data = ?7, agent_task_id = ?8, retry_count = ?9, max_retries = ?10,
                       error_message = ?11, updated_at = ?12, started_at = ?13, completed_at = ?14
                     WHERE id = ?1",
                    rusqlite::params![
                        s.id,
                        s.name,
                        s.description,
                        s.status.as_str(),
                        s.config.to_string(),
                        s.input_data.to_string(),
                        s.output_data.to_string(),
                        s.agent_task_id,
                        s.retry_count,
                        s.max_retries,
                        s.error_message,
                        now,
                        s.started_at.map(|t| t.timestamp_millis()),
                        s.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )
            })
            .await?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("Step {}", step.id)));
        }
        Ok(())
    }

    pub async fn add_dependency(&self, step_id: &str, depends_on_id: &str) -> Result<(), EngineError> {
        if step_id == depends_on_id {
            return Err(EngineError::BadRequest(format!(
                "Step {} cannot depend on itself",
                step_id
            )));
        }
        let step_id = step_id.to_string();
        let depends_on_id = depends_on_id.to_string();
        self.db
            .with_conn_async(move |conn| insert_dependency(conn, &step_id, &depends_on_id))
            .await
    }

    /// Put steps that failed in an earlier run back to PENDING with a fresh retry budget.
    pub async fn reset_failed(&self, workflow_id: &str) -> Result<usize, EngineError> {
        let workflow_id = workflow_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_steps SET status = 'PENDING', retry_count = 0, error_message = '',
                       started_at = NULL, completed_at = NULL, updated_at = ?2
                     WHERE workflow_id = ?1 AND status = 'FAILED'",
                    rusqlite::params![workflow_id, now],
                )
            })
            .await
    }

    /// Steps left RUNNING by a process that died mid-step go back to PENDING.
    pub async fn reset_interrupted(&self, workflow_id: &str) -> Result<usize, EngineError> {
        let workflow_id = workflow_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_steps SET status = 'PENDING', started_at = NULL, updated_at = ?2
                     WHERE workflow_id = ?1 AND status = 'RUNNING'",
                    rusqlite::params![workflow_id, now],
                )
            })
            .await
    }
}

pub(crate) fn insert_step(conn: &Connection, s: &WorkflowStep) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO workflow_steps ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            STEP_COLUMNS
        ),
        rusqlite::params![
            s.id,
            s.workflow_id,
            s.step_order,
            s.name,
            s.description,
            s.step_type.as_str(),
            s.status.as_str(),
            s.config.to_string(),
            s.input_data.to_string(),
            s.output_data.to_string(),
            s.agent_task_id,
            s.retry_count,
            s.max_retries,
            s.error_message,
            s.created_at.timestamp_millis(),
            s.updated_at.timestamp_millis(),
            s.started_at.map(|t| t.timestamp_millis()),
            s.completed_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_dependency(
    conn: &Connection,
    step_id: &str,
    depends_on_id: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO workflow_step_deps (step_id, depends_on_id) VALUES (?1, ?2)",
        rusqlite::params![step_id, depends_on_id],
    )?;
    Ok(())
}

fn load_dependencies(conn: &Connection, step_id: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM workflow_step_deps WHERE step_id = ?1 ORDER BY depends_on_id",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![step_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

fn row_to_step(row: &Row<'_>) -> WorkflowStep {
    WorkflowStep {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        step_order: row.get(2).unwrap_or(0),
        name: row.get(3).unwrap_or_default(),
        description: row.get(4).unwrap_or_default(),
        step_type: StepType::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(StepType::Parallel),
        status: StepStatus::from_str(&row.get::<_, String>(6).unwrap_or_default()),
        config: json_or_empty(row.get(7).ok()),
        input_data: json_or_empty(row.get(8).ok()),
        output_data: json_or_empty(row.get(9).ok()),
        agent_task_id: row.get(10).unwrap_or(None),
        depends_on: Vec::new(),
        retry_count: row.get(11).unwrap_or(0),
        max_retries: row.get(12).unwrap_or(DEFAULT_MAX_RETRIES),
        error_message: row.get(13).unwrap_or_default(),
        created_at: ms_to_dt(row.get(14).ok()),
        updated_at: ms_to_dt(row.get(15).ok()),
        started_at: opt_ms_to_dt(row.get(16).unwrap_or(None)),
        completed_at: opt_ms_to_dt(row.get(17).unwrap_or(None)),
    }
}
