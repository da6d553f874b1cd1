pub mod agent_task;
pub mod step;
pub mod template;
pub mod workflow;

pub use agent_task::*;
pub use step::*;
pub use template::*;
pub use workflow::*;

/// Default for JSON blob columns: `{}`.
pub fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
