//! Workflow engine: dependency-ordered execution of heterogeneous steps.
//!
//! # Architecture
//!
//! ```text
//! template.yaml ──► TemplateInstantiator ──► Workflow + WorkflowSteps (SQLite)
//!                                                    │
//!                                              WorkflowEngine
//!                                     (CAS state machine, passes, leases)
//!                                                    │
//!                          resolver::is_eligible ──► RetryController
//!                                                    │
//!                                               StepExecutor
//!                          ┌──────────┬──────────┬───┴──────┬──────────┐
//!                     AGENT_TASK  HUMAN_APPROVAL CONDITION  WEBHOOK    DELAY
//!                          │                        │         │
//!                  AgentTaskRunner            condition    WebhookCaller
//! ```

pub mod agent;
pub mod condition;
pub mod engine;
pub mod executor;
pub mod instantiator;
pub mod resolver;
pub mod retry;
pub mod webhook;

pub use agent::{AgentHandler, AgentRegistry, AgentTaskRunner, EchoAgent, RegistryTaskRunner};
pub use condition::Condition;
pub use engine::{BatchOutcome, WorkflowEngine, WorkflowRunSummary};
pub use executor::{StepContext, StepExecutor, StepOutcome};
pub use instantiator::{validate_specs, TemplateInstantiator};
pub use retry::{RetryController, RetryPolicy, StepAttempt};
pub use webhook::{HttpWebhookCaller, WebhookCaller, WebhookRequest, WebhookResponse};
