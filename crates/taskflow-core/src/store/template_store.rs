use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::template::{TemplateDefinition, WorkflowTemplate};
use crate::models::workflow::WorkflowType;

use super::{json_or_empty, ms_to_dt};

const TEMPLATE_COLUMNS: &str = "id, name, description, workflow_type, template_config, is_active, \
     usage_count, created_by, created_at, updated_at";

#[derive(Clone)]
pub struct TemplateStore {
    db: Database,
}

impl TemplateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a template (matched by id).
    pub async fn save(&self, template: &WorkflowTemplate) -> Result<(), EngineError> {
        let t = template.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO workflow_templates ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                         ON CONFLICT(id) DO UPDATE SET
                           name = excluded.name,
                           description = excluded.description,
                           workflow_type = excluded.workflow_type,
                           template_config = excluded.template_config,
                           is_active = excluded.is_active,
                           updated_at = excluded.updated_at",
                        TEMPLATE_COLUMNS
                    ),
                    rusqlite::params![
                        t.id,
                        t.name,
                        t.description,
                        t.workflow_type.as_str(),
                        t.template_config.to_string(),
                        t.is_active as i64,
                        t.usage_count,
                        t.created_by,
                        t.created_at.timestamp_millis(),
                        t.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                EngineError::Database(msg) if msg.contains("UNIQUE") => EngineError::Conflict(
                    format!("A template named '{}' already exists", template.name),
                ),
                other => other,
            })
    }

    /// Store a parsed YAML definition, replacing the config of an existing template
    /// with the same name.
    pub async fn import(
        &self,
        def: &TemplateDefinition,
        created_by: Option<&str>,
    ) -> Result<WorkflowTemplate, EngineError> {
        let config = def.template_config()?;
        let template = match self.get_by_name(&def.name).await? {
            Some(mut existing) => {
                existing.description = def.description.clone();
                existing.workflow_type = def.workflow_type;
                existing.template_config = config;
                existing.updated_at = Utc::now();
                existing
            }
            None => {
                let mut t = WorkflowTemplate::new(
                    Uuid::new_v4().to_string(),
                    def.name.clone(),
                    def.description.clone(),
                    def.workflow_type,
                    config,
                );
                t.created_by = created_by.map(str::to_string);
                t
            }
        };
        self.save(&template).await?;
        tracing::info!(
            "[Templates] Imported template '{}' ({} steps)",
            template.name,
            def.steps.len()
        );
        Ok(template)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowTemplate>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflow_templates WHERE id = ?1", TEMPLATE_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_template(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<WorkflowTemplate>, EngineError> {
        let name = name.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflow_templates WHERE name = ?1", TEMPLATE_COLUMNS),
                    rusqlite::params![name],
                    |row| Ok(row_to_template(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<WorkflowTemplate>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_templates WHERE (?1 = 0 OR is_active = 1) ORDER BY name",
                    TEMPLATE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![active_only as i64], |row| {
                        Ok(row_to_template(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<bool, EngineError> {
        let id = id.to_string();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_templates SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![active as i64, now, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "DELETE FROM workflow_templates WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

pub(crate) fn increment_usage(conn: &Connection, template_id: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE workflow_templates SET usage_count = usage_count + 1, updated_at = ?1 WHERE id = ?2",
        rusqlite::params![Utc::now().timestamp_millis(), template_id],
    )?;
    Ok(())
}

fn row_to_template(row: &Row<'_>) -> WorkflowTemplate {
    WorkflowTemplate {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or_default(),
        workflow_type: WorkflowType::from_str(&row.get::<_, String>(3).unwrap_or_default()),
        template_config: json_or_empty(row.get(4).ok()),
        is_active: row.get::<_, i64>(5).unwrap_or(1) != 0,
        usage_count: row.get(6).unwrap_or(0),
        created_by: row.get(7).unwrap_or(None),
        created_at: ms_to_dt(row.get(8).ok()),
        updated_at: ms_to_dt(row.get(9).ok()),
    }
}
