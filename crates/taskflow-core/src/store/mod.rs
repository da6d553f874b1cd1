pub mod agent_task_store;
pub mod step_store;
pub mod template_store;
pub mod workflow_store;

pub use agent_task_store::AgentTaskStore;
pub use step_store::StepStore;
pub use template_store::TemplateStore;
pub use workflow_store::{TransitionPatch, WorkflowStore};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::empty_object;

/// Parse a JSON text column, falling back to `{}` for missing or corrupt values.
pub(crate) fn json_or_empty(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(empty_object)
}

pub(crate) fn ms_to_dt(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

pub(crate) fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}
