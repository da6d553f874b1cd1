//! SQLite database layer for the Taskflow engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a closure inside a single transaction.
    /// The transaction commits only if the closure returns `Ok`; any error rolls it back.
    pub async fn with_transaction_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn_async(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agent_tasks (
                    id              TEXT PRIMARY KEY,
                    kind            TEXT,
                    title           TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    input_data      TEXT NOT NULL DEFAULT '{}',
                    output_data     TEXT NOT NULL DEFAULT '{}',
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    error           TEXT,
                    created_by      TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_templates (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL UNIQUE,
                    description     TEXT NOT NULL DEFAULT '',
                    workflow_type   TEXT NOT NULL DEFAULT 'CUSTOM',
                    template_config TEXT NOT NULL DEFAULT '{}',
                    is_active       INTEGER NOT NULL DEFAULT 1,
                    usage_count     INTEGER NOT NULL DEFAULT 0,
                    created_by      TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    workflow_type   TEXT NOT NULL DEFAULT 'CUSTOM',
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    config          TEXT NOT NULL DEFAULT '{}',
                    input_data      TEXT NOT NULL DEFAULT '{}',
                    output_data     TEXT NOT NULL DEFAULT '{}',
                    current_step    INTEGER NOT NULL DEFAULT 0,
                    total_steps     INTEGER NOT NULL DEFAULT 0,
                    priority        INTEGER NOT NULL DEFAULT 5,
                    created_by      TEXT,
                    error_message   TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER,
                    CHECK (current_step <= total_steps)
                );
                CREATE INDEX IF NOT EXISTS idx_workflows_type_status ON workflows(workflow_type, status);
                CREATE INDEX IF NOT EXISTS idx_workflows_created_by_status ON workflows(created_by, status);

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    step_order      INTEGER NOT NULL,
                    name            TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    step_type       TEXT NOT NULL DEFAULT 'AGENT_TASK',
                    status          TEXT NOT NULL DEFAULT 'PENDING',
                    config          TEXT NOT NULL DEFAULT '{}',
                    input_data      TEXT NOT NULL DEFAULT '{}',
                    output_data     TEXT NOT NULL DEFAULT '{}',
                    agent_task_id   TEXT REFERENCES agent_tasks(id) ON DELETE SET NULL,
                    retry_count     INTEGER NOT NULL DEFAULT 0,
                    max_retries     INTEGER NOT NULL DEFAULT 3,
                    error_message   TEXT NOT NULL DEFAULT '',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER,
                    UNIQUE (workflow_id, step_order)
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow ON workflow_steps(workflow_id, step_order);

                CREATE TABLE IF NOT EXISTS workflow_step_deps (
                    step_id         TEXT NOT NULL REFERENCES workflow_steps(id) ON DELETE CASCADE,
                    depends_on_id   TEXT NOT NULL REFERENCES workflow_steps(id) ON DELETE CASCADE,
                    PRIMARY KEY (step_id, depends_on_id)
                );
                CREATE INDEX IF NOT EXISTS idx_workflow_step_deps_target ON workflow_step_deps(depends_on_id);
                ",
            )
        })
    }
}
