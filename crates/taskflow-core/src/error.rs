//! Core error type for the Taskflow engine.
//!
//! `EngineError` is used throughout the core (stores, engine, collaborators).
//! Callers such as the CLI or a scheduler decide how to surface it.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An invalid state transition was attempted (double start, resume when not paused, ...).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unsupported step type: {0}")]
    UnsupportedStepType(String),

    /// A step failed after its retries were exhausted.
    #[error("Step {step_id} failed after {retry_count} retries: {message}")]
    StepExecution {
        step_id: String,
        retry_count: u32,
        message: String,
    },

    /// The step graph of a template contains a cycle (member step names).
    #[error("Dependency cycle between steps: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// Steps that can never become eligible in the current run.
    #[error("Workflow stalled, steps can never run: {}", .0.join(", "))]
    DependencyStall(Vec<String>),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl EngineError {
    /// Whether the error is worth another attempt by the retry controller.
    /// Bad step configuration and condition errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::UnsupportedStepType(_)
                | EngineError::Cancelled(_)
                | EngineError::Database(_)
                | EngineError::BadRequest(_)
                | EngineError::Condition(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::BadRequest(format!("Invalid JSON: {}", e))
    }
}
