use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::empty_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "SKIPPED" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    /// Whether the step no longer needs work from the engine.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    #[default]
    AgentTask,
    HumanApproval,
    Condition,
    /// Stored but not executed by the engine.
    Parallel,
    Webhook,
    Delay,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentTask => "AGENT_TASK",
            Self::HumanApproval => "HUMAN_APPROVAL",
            Self::Condition => "CONDITION",
            Self::Parallel => "PARALLEL",
            Self::Webhook => "WEBHOOK",
            Self::Delay => "DELAY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AGENT_TASK" => Some(Self::AgentTask),
            "HUMAN_APPROVAL" => Some(Self::HumanApproval),
            "CONDITION" => Some(Self::Condition),
            "PARALLEL" => Some(Self::Parallel),
            "WEBHOOK" => Some(Self::Webhook),
            "DELAY" => Some(Self::Delay),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A single unit of work inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub step_order: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default = "empty_object")]
    pub output_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_task_id: Option<String>,
    /// Ids of predecessor steps.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(
        id: String,
        workflow_id: String,
        step_order: u32,
        name: String,
        step_type: StepType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id,
            step_order,
            name,
            description: String::new(),
            step_type,
            status: StepStatus::Pending,
            config: empty_object(),
            input_data: empty_object(),
            output_data: empty_object(),
            agent_task_id: None,
            depends_on: Vec::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A HUMAN_APPROVAL step that was dispatched and now waits for an external decision.
    pub fn is_awaiting_approval(&self) -> bool {
        self.step_type == StepType::HumanApproval
            && self.status == StepStatus::Pending
            && self.started_at.is_some()
    }
}

/// Input for creating a step by hand (outside template instantiation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStepInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub step_type: StepType,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}
