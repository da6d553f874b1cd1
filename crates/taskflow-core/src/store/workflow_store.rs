use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::workflow::{Workflow, WorkflowFilter, WorkflowStatus, WorkflowType};

use super::{json_or_empty, ms_to_dt, opt_ms_to_dt};

const WORKFLOW_COLUMNS: &str = "id, name, description, workflow_type, status, config, input_data, \
     output_data, current_step, total_steps, priority, created_by, error_message, created_at, \
     updated_at, started_at, completed_at";

/// Field changes applied together with a guarded status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    /// Clear a previous run's error message.
    pub clear_error: bool,
}

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let wf = workflow.clone();
        self.db
            .with_conn_async(move |conn| insert_workflow(conn, &wf))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    /// Like [`get`](Self::get) but a missing workflow is an error.
    pub async fn require(&self, id: &str) -> Result<Workflow, EngineError> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {}", id)))
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<WorkflowStatus>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT status FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await
            .map(|s| s.map(|s| WorkflowStatus::from_str(&s)))
    }

    pub async fn list(&self, filter: WorkflowFilter) -> Result<Vec<Workflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflows
                     WHERE (?1 IS NULL OR status = ?1)
                       AND (?2 IS NULL OR workflow_type = ?2)
                       AND (?3 IS NULL OR created_by = ?3)
                     ORDER BY created_at DESC
                     LIMIT ?4",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            filter.status.map(|s| s.as_str()),
                            filter.workflow_type.map(|t| t.as_str()),
                            filter.created_by,
                            filter.limit.map(i64::from).unwrap_or(-1),
                        ],
                        |row| Ok(row_to_workflow(row)),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// PENDING workflows in run order: lowest priority value first, then oldest.
    pub async fn list_runnable(&self, limit: u32) -> Result<Vec<Workflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflows WHERE status = 'PENDING'
                     ORDER BY priority ASC, created_at ASC LIMIT ?1",
                    WORKFLOW_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![i64::from(limit)], |row| {
                        Ok(row_to_workflow(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Compare-and-swap the status: applies only when the stored status is one of `from`.
    /// Returns whether the row was updated.
    pub async fn transition(
        &self,
        id: &str,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
        patch: TransitionPatch,
    ) -> Result<bool, EngineError> {
        let id = id.to_string();
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE workflows SET
                           status = ?1,
                           updated_at = ?2,
                           started_at = COALESCE(?3, started_at),
                           completed_at = COALESCE(?4, completed_at),
                           input_data = COALESCE(?5, input_data),
                           output_data = COALESCE(?6, output_data),
                           error_message = CASE WHEN ?7 THEN NULL ELSE COALESCE(?8, error_message) END
                         WHERE id = ?9 AND status IN ({})",
                        allowed
                    ),
                    rusqlite::params![
                        to.as_str(),
                        now,
                        patch.started_at.map(|t| t.timestamp_millis()),
                        patch.completed_at.map(|t| t.timestamp_millis()),
                        patch.input_data.map(|v| v.to_string()),
                        patch.output_data.map(|v| v.to_string()),
                        patch.clear_error,
                        patch.error_message,
                        id,
                    ],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn update_progress(
        &self,
        id: &str,
        current_step: u32,
        total_steps: u32,
    ) -> Result<(), EngineError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflows SET current_step = ?1, total_steps = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![current_step, total_steps, now, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_priority(&self, id: &str, priority: i32) -> Result<(), EngineError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflows SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![priority, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Delete a workflow; its steps and their dependency edges go with it.
    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

pub(crate) fn insert_workflow(conn: &Connection, wf: &Workflow) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO workflows ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            WORKFLOW_COLUMNS
        ),
        rusqlite::params![
            wf.id,
            wf.name,
            wf.description,
            wf.workflow_type.as_str(),
            wf.status.as_str(),
            wf.config.to_string(),
            wf.input_data.to_string(),
            wf.output_data.to_string(),
            wf.current_step,
            wf.total_steps,
            wf.priority,
            wf.created_by,
            wf.error_message,
            wf.created_at.timestamp_millis(),
            wf.updated_at.timestamp_millis(),
            wf.started_at.map(|t| t.timestamp_millis()),
            wf.completed_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn row_to_workflow(row: &Row<'_>) -> Workflow {
    Workflow {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or_default(),
        workflow_type: WorkflowType::from_str(&row.get::<_, String>(3).unwrap_or_default()),
        status: WorkflowStatus::from_str(&row.get::<_, String>(4).unwrap_or_default()),
        config: json_or_empty(row.get(5).ok()),
        input_data: json_or_empty(row.get(6).ok()),
        output_data: json_or_empty(row.get(7).ok()),
        current_step: row.get(8).unwrap_or(0),
        total_steps: row.get(9).unwrap_or(0),
        priority: row.get(10).unwrap_or(crate::models::DEFAULT_PRIORITY),
        created_by: row.get(11).unwrap_or(None),
        error_message: row.get(12).unwrap_or(None),
        created_at: ms_to_dt(row.get(13).ok()),
        updated_at: ms_to_dt(row.get(14).ok()),
        started_at: opt_ms_to_dt(row.get(15).unwrap_or(None)),
        completed_at: opt_ms_to_dt(row.get(16).unwrap_or(None)),
    }
}
