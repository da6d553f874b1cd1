//! Reusable workflow templates.
//!
//! A template file is YAML:
//!
//! ```yaml
//! name: "Bug Lifecycle"
//! description: "Triage, fix and notify"
//! workflow_type: BUG_LIFECYCLE
//!
//! steps:
//!   - name: "Triage"
//!     step_type: AGENT_TASK
//!     config:
//!       agent_type: "bug_triage"
//!
//!   - name: "Notify"
//!     step_type: WEBHOOK
//!     config:
//!       url: "https://hooks.example.com/bugs"
//!     depends_on: ["Triage"]
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{empty_object, StepType, WorkflowType, DEFAULT_MAX_RETRIES};
use crate::error::EngineError;

/// One step of a template's recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub step_type: StepType,

    /// Type-specific configuration (agent_type, url, delay_seconds, condition, ...)
    #[serde(default = "empty_object")]
    pub config: Value,

    #[serde(default = "empty_object")]
    pub input_data: Value,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Names of steps in the same template that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A named, versionable recipe for stamping out workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow_type: WorkflowType,
    /// Whole template configuration; `steps` holds the ordered step specs.
    pub template_config: Value,
    pub is_active: bool,
    pub usage_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowTemplate {
    pub fn new(
        id: String,
        name: String,
        description: String,
        workflow_type: WorkflowType,
        template_config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description,
            workflow_type,
            template_config,
            is_active: true,
            usage_count: 0,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the ordered step specs out of `template_config.steps`.
    pub fn step_specs(&self) -> Result<Vec<StepSpec>, EngineError> {
        match self.template_config.get("steps") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(steps) => serde_json::from_value(steps.clone()).map_err(|e| {
                EngineError::BadRequest(format!(
                    "Template '{}' has invalid steps: {}",
                    self.name, e
                ))
            }),
        }
    }
}

/// Template definition as written in a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub workflow_type: WorkflowType,

    /// Extra template-level settings copied into every instantiated workflow's config
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,

    pub steps: Vec<StepSpec>,
}

impl TemplateDefinition {
    /// Parse a template definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::BadRequest(format!("Failed to parse template YAML: {}", e)))
    }

    /// Load a template definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::BadRequest(format!("Failed to read template file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Build the stored `template_config` blob: settings plus the ordered steps.
    pub fn template_config(&self) -> Result<Value, EngineError> {
        let mut config = self.settings.clone();
        config.insert("steps".to_string(), serde_json::to_value(&self.steps)?);
        Ok(Value::Object(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_template() {
        let yaml = r#"
name: "Review"
steps:
  - name: "Check"
    step_type: CONDITION
    config:
      condition: "lines < 400"
"#;
        let def = TemplateDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name, "Review");
        assert_eq!(def.workflow_type, WorkflowType::Custom);
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].step_type, StepType::Condition);
        assert_eq!(def.steps[0].max_retries, DEFAULT_MAX_RETRIES);
        assert!(def.steps[0].depends_on.is_empty());
    }

    #[test]
    fn test_template_config_round_trips_steps() {
        let yaml = r#"
name: "Release"
workflow_type: RELEASE
settings:
  channel: "stable"
steps:
  - name: "Build"
    step_type: AGENT_TASK
    max_retries: 1
  - name: "Wait"
    step_type: DELAY
    config:
      delay_seconds: 5
    depends_on: ["Build"]
"#;
        let def = TemplateDefinition::from_yaml(yaml).unwrap();
        let config = def.template_config().unwrap();
        assert_eq!(config["channel"], "stable");

        let template = WorkflowTemplate::new(
            "t1".into(),
            def.name.clone(),
            String::new(),
            def.workflow_type,
            config,
        );
        let specs = template.step_specs().unwrap();
        assert_eq!(specs, def.steps);
        assert_eq!(specs[1].depends_on, vec!["Build".to_string()]);
    }

    #[test]
    fn test_unknown_step_type_is_rejected() {
        let yaml = r#"
name: "Bad"
steps:
  - name: "Fan out"
    step_type: MAP
"#;
        assert!(TemplateDefinition::from_yaml(yaml).is_err());
    }
}
