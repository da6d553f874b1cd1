use chrono::Utc;
use rusqlite::{OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::agent_task::{AgentTask, AgentTaskStatus, CreateAgentTaskInput};
use crate::models::empty_object;

use super::{json_or_empty, ms_to_dt};

const TASK_COLUMNS: &str =
    "id, kind, title, description, input_data, output_data, status, error, created_by, created_at, updated_at";

/// Repository for the agent task records that AGENT_TASK steps delegate to.
#[derive(Clone)]
pub struct AgentTaskStore {
    db: Database,
}

impl AgentTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateAgentTaskInput) -> Result<AgentTask, EngineError> {
        let now = Utc::now();
        let task = AgentTask {
            id: Uuid::new_v4().to_string(),
            kind: input.kind,
            title: input.title,
            description: input.description,
            input_data: input.input_data,
            output_data: empty_object(),
            status: AgentTaskStatus::Pending,
            error: None,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
        };
        let t = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO agent_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        TASK_COLUMNS
                    ),
                    rusqlite::params![
                        t.id,
                        t.kind,
                        t.title,
                        t.description,
                        t.input_data.to_string(),
                        t.output_data.to_string(),
                        t.status.as_str(),
                        t.error,
                        t.created_by,
                        t.created_at.timestamp_millis(),
                        t.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AgentTask>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM agent_tasks WHERE id = ?1", TASK_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_task(row)),
                )
                .optional()
            })
            .await
    }

    /// Record a status change together with the output or error it produced.
    pub async fn update_status(
        &self,
        id: &str,
        status: AgentTaskStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE agent_tasks SET status = ?1, output_data = COALESCE(?2, output_data),
                       error = ?3, updated_at = ?4 WHERE id = ?5",
                    rusqlite::params![
                        status.as_str(),
                        output.map(|v| v.to_string()),
                        error,
                        now,
                        id
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM agent_tasks WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_task(row: &Row<'_>) -> AgentTask {
    AgentTask {
        id: row.get(0).unwrap_or_default(),
        kind: row.get(1).unwrap_or(None),
        title: row.get(2).unwrap_or_default(),
        description: row.get(3).unwrap_or_default(),
        input_data: json_or_empty(row.get(4).ok()),
        output_data: json_or_empty(row.get(5).ok()),
        status: AgentTaskStatus::from_str(&row.get::<_, String>(6).unwrap_or_default()),
        error: row.get(7).unwrap_or(None),
        created_by: row.get(8).unwrap_or(None),
        created_at: ms_to_dt(row.get(9).ok()),
        updated_at: ms_to_dt(row.get(10).ok()),
    }
}
