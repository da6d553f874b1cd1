use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::empty_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "RUNNING" => Self::Running,
            "PAUSED" => Self::Paused,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// COMPLETED and CANCELLED workflows never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    BugLifecycle,
    FeatureDevelopment,
    ChangeRequest,
    Release,
    CodeReview,
    #[default]
    #[serde(other)]
    Custom,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BugLifecycle => "BUG_LIFECYCLE",
            Self::FeatureDevelopment => "FEATURE_DEVELOPMENT",
            Self::ChangeRequest => "CHANGE_REQUEST",
            Self::Release => "RELEASE",
            Self::CodeReview => "CODE_REVIEW",
            Self::Custom => "CUSTOM",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "BUG_LIFECYCLE" => Self::BugLifecycle,
            "FEATURE_DEVELOPMENT" => Self::FeatureDevelopment,
            "CHANGE_REQUEST" => Self::ChangeRequest,
            "RELEASE" => Self::Release,
            "CODE_REVIEW" => Self::CodeReview,
            _ => Self::Custom,
        }
    }
}

/// One execution instance of a process made of ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    /// Stays an empty object until the workflow is COMPLETED.
    #[serde(default = "empty_object")]
    pub output_data: Value,
    pub current_step: u32,
    pub total_steps: u32,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_PRIORITY: i32 = 5;

impl Workflow {
    pub fn new(id: String, name: String, workflow_type: WorkflowType, input_data: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description: String::new(),
            workflow_type,
            status: WorkflowStatus::Pending,
            config: empty_object(),
            input_data,
            output_data: empty_object(),
            current_step: 0,
            total_steps: 0,
            priority: DEFAULT_PRIORITY,
            created_by: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        f64::from(self.current_step) / f64::from(self.total_steps) * 100.0
    }
}

/// Filter for listing workflows.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<WorkflowType>,
    pub created_by: Option<String>,
    pub limit: Option<u32>,
}
