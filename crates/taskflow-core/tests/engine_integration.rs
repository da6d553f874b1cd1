//! Integration tests for the workflow engine.
//!
//! Workflows are built from YAML templates on an in-memory SQLite database;
//! agents and webhooks are scripted fakes.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::Harness;
use taskflow_core::models::{StepStatus, WorkflowStatus};
use taskflow_core::store::{TransitionPatch, WorkflowStore};
use taskflow_core::workflow::AgentTaskRunner;
use taskflow_core::{Database, EngineError};

const BUG_FLOW: &str = r#"
name: "Bug Lifecycle"
workflow_type: BUG_LIFECYCLE
steps:
  - name: "Triage"
    step_type: AGENT_TASK
    config:
      agent_type: "bug_triage"
  - name: "Severe?"
    step_type: CONDITION
    config:
      condition: "amount > 100"
    input_data:
      amount: 150
    depends_on: ["Triage"]
  - name: "Notify"
    step_type: WEBHOOK
    config:
      url: "https://hooks.example.com/bugs"
    input_data:
      channel: "bugs"
    depends_on: ["Severe?"]
"#;

#[tokio::test]
async fn test_three_step_workflow_completes() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(BUG_FLOW, json!({"bug": 42})).await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert!(summary.pending_steps.is_empty());
    assert_eq!(summary.results.len(), 3);
    assert_eq!(summary.results["Severe?"]["action"], "continue");
    assert_eq!(summary.results["Notify"], json!({"status_code": 200, "response": {"ok": true}}));

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.current_step, 3);
    assert_eq!(stored.total_steps, 3);
    assert_eq!(stored.progress_percentage(), 100.0);
    assert!(stored.started_at.is_some() && stored.completed_at.is_some());

    let output = stored.output_data.as_object().unwrap();
    let mut keys: Vec<&str> = output.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["Notify", "Severe?", "Triage"]);
    assert_eq!(output["Triage"]["input"]["bug"], 42);
    assert_eq!(h.agents.ran(), vec!["Triage"]);
}

#[tokio::test]
async fn test_override_input_replaces_workflow_input() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(BUG_FLOW, json!({"bug": 1})).await;

    h.engine
        .execute_workflow(&wf.id, Some(json!({"bug": 99})))
        .await
        .unwrap();
    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.input_data, json!({"bug": 99}));
    assert_eq!(stored.output_data["Triage"]["input"]["bug"], 99);
}

const NOTIFY_THEN_WAIT: &str = r#"
name: "Notify then wait"
steps:
  - name: "Notify"
    step_type: WEBHOOK
    max_retries: 1
    config:
      url: "https://hooks.example.com/x"
  - name: "Wait"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["Notify"]
"#;

#[tokio::test]
async fn test_exhausted_retries_fail_the_workflow() {
    let h = Harness::with_webhook_failures(u32::MAX);
    let wf = h.workflow_from_yaml(NOTIFY_THEN_WAIT, json!({})).await;

    let err = h.engine.execute_workflow(&wf.id, None).await.unwrap_err();
    match &err {
        EngineError::StepExecution { retry_count, message, .. } => {
            assert_eq!(*retry_count, 1);
            assert!(message.contains("connection refused"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.webhooks.calls(), 2);

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some(err.to_string().as_str()));
    assert_eq!(stored.output_data, json!({}));

    let notify = h.step_named(&wf.id, "Notify").await;
    assert_eq!(notify.status, StepStatus::Failed);
    assert_eq!(notify.retry_count, 1);
    assert!(notify.error_message.contains("connection refused"));

    let wait = h.step_named(&wf.id, "Wait").await;
    assert_eq!(wait.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_retry_then_success() {
    let h = Harness::with_webhook_failures(1);
    let wf = h.workflow_from_yaml(NOTIFY_THEN_WAIT, json!({})).await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    let notify = h.step_named(&wf.id, "Notify").await;
    assert_eq!(notify.retry_count, 1);
    assert_eq!(notify.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_failed_workflow_can_be_re_executed() {
    let h = Harness::with_webhook_failures(2);
    let wf = h.workflow_from_yaml(NOTIFY_THEN_WAIT, json!({})).await;

    assert!(h.engine.execute_workflow(&wf.id, None).await.is_err());
    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert!(stored.error_message.is_none());
    assert_eq!(stored.current_step, 2);
    assert_eq!(h.step_named(&wf.id, "Notify").await.retry_count, 0);
}

#[tokio::test]
async fn test_zero_delay_step() {
    let h = Harness::new();
    let wf = h
        .workflow_from_yaml(
            r#"
name: "Just wait"
steps:
  - name: "Wait"
    step_type: DELAY
    config:
      delay_seconds: 0
"#,
            json!({}),
        )
        .await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.results["Wait"]["delayed"], 0);
    assert_eq!(summary.results["Wait"]["message"], "Waited for 0 seconds");
}

const AGENT_WEBHOOK_DELAY: &str = r#"
name: "Agent, webhook, delay"
steps:
  - name: "step0"
    step_type: AGENT_TASK
    config:
      agent_type: "echo"
  - name: "step1"
    step_type: WEBHOOK
    config:
      url: "https://hooks.example.com/done"
    depends_on: ["step0"]
  - name: "step2"
    step_type: DELAY
    config:
      delay_seconds: 1
    depends_on: ["step1"]
"#;

#[tokio::test]
async fn test_agent_webhook_delay_chain_completes() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(AGENT_WEBHOOK_DELAY, json!({"ticket": 7})).await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert!(summary.execution_time >= 1.0);

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.current_step, 3);
    assert_eq!(stored.total_steps, 3);

    let output = stored.output_data.as_object().unwrap();
    let mut keys: Vec<&str> = output.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["step0", "step1", "step2"]);
    assert_eq!(output["step0"]["input"]["ticket"], 7);
    assert_eq!(output["step1"], json!({"status_code": 200, "response": {"ok": true}}));
    assert_eq!(
        output["step2"],
        json!({"delayed": 1, "message": "Waited for 1 seconds"})
    );
    assert_eq!(h.webhooks.calls(), 1);
}

#[tokio::test]
async fn test_failing_webhook_leaves_delay_pending() {
    let h = Harness::with_webhook_failures(u32::MAX);
    let wf = h.workflow_from_yaml(AGENT_WEBHOOK_DELAY, json!({})).await;

    let err = h.engine.execute_workflow(&wf.id, None).await.unwrap_err();
    assert!(matches!(&err, EngineError::StepExecution { retry_count: 3, .. }));
    assert_eq!(h.webhooks.calls(), 4);

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert_eq!(stored.current_step, 1);
    assert_eq!(h.step_named(&wf.id, "step0").await.status, StepStatus::Completed);
    assert_eq!(h.step_named(&wf.id, "step1").await.status, StepStatus::Failed);
    assert_eq!(h.step_named(&wf.id, "step2").await.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_completed_or_running_workflow_cannot_start() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(BUG_FLOW, json!({})).await;
    h.engine.execute_workflow(&wf.id, None).await.unwrap();

    let err = h.engine.execute_workflow(&wf.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // A RUNNING workflow owned by another process is rejected by the stored status alone.
    let other = h.workflow_from_yaml(BUG_FLOW, json!({})).await;
    h.workflows
        .transition(&other.id, &[WorkflowStatus::Pending], WorkflowStatus::Running, TransitionPatch::default())
        .await
        .unwrap();
    let err = h.engine.execute_workflow(&other.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(h.agents.ran().len(), 1);
}

#[tokio::test]
async fn test_missing_workflow_is_not_found() {
    let h = Harness::new();
    assert!(matches!(
        h.engine.execute_workflow("nope", None).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(h.engine.pause("nope").await, Err(EngineError::NotFound(_))));
}

const LONG_WAIT: &str = r#"
name: "Long wait"
steps:
  - name: "Sleep"
    step_type: DELAY
    config:
      delay_seconds: 3600
  - name: "After"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["Sleep"]
"#;

async fn wait_for_step_status(h: &Harness, workflow_id: &str, name: &str, status: StepStatus) {
    for _ in 0..200 {
        if h.step_named(workflow_id, name).await.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("step {name} never reached {status}");
}

#[tokio::test]
async fn test_concurrent_start_conflicts_and_cancel_interrupts_delay() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(LONG_WAIT, json!({})).await;

    let engine = h.engine.clone();
    let id = wf.id.clone();
    let run = tokio::spawn(async move { engine.execute_workflow(&id, None).await });

    wait_for_step_status(&h, &wf.id, "Sleep", StepStatus::Running).await;
    assert!(matches!(
        h.engine.execute_workflow(&wf.id, None).await,
        Err(EngineError::Conflict(_))
    ));

    h.engine.cancel(&wf.id).await.unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancel should interrupt the delay")
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, WorkflowStatus::Cancelled);
    assert_eq!(summary.pending_steps, vec!["Sleep", "After"]);

    let sleep = h.step_named(&wf.id, "Sleep").await;
    assert_eq!(sleep.status, StepStatus::Pending);
    assert!(sleep.started_at.is_none());

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Cancelled);
    assert!(matches!(h.engine.cancel(&wf.id).await, Err(EngineError::Conflict(_))));
    assert!(matches!(
        h.engine.execute_workflow(&wf.id, None).await,
        Err(EngineError::Conflict(_))
    ));
}

/// Pauses its own workflow while "working", like an operator pausing mid-step.
struct PausingAgent {
    workflows: WorkflowStore,
    target: Mutex<Option<String>>,
}

#[async_trait]
impl AgentTaskRunner for PausingAgent {
    async fn run_task(&self, _task_id: &str) -> Result<Value, EngineError> {
        let target = self.target.lock().unwrap().clone();
        if let Some(id) = target {
            self.workflows
                .transition(&id, &[WorkflowStatus::Running], WorkflowStatus::Paused, TransitionPatch::default())
                .await?;
        }
        Ok(json!({"done": true}))
    }
}

#[tokio::test]
async fn test_pause_stops_before_next_step_and_resume_continues() {
    let db = Database::open_in_memory().unwrap();
    let agent = Arc::new(PausingAgent {
        workflows: WorkflowStore::new(db.clone()),
        target: Mutex::new(None),
    });
    let h = Harness::with_runner(db, agent.clone());
    let wf = h
        .workflow_from_yaml(
            r#"
name: "Pause me"
steps:
  - name: "Work"
    step_type: AGENT_TASK
    config:
      agent_type: "worker"
  - name: "Ship"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["Work"]
"#,
            json!({}),
        )
        .await;
    *agent.target.lock().unwrap() = Some(wf.id.clone());

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Paused);
    assert_eq!(summary.pending_steps, vec!["Ship"]);
    assert_eq!(h.step_named(&wf.id, "Work").await.status, StepStatus::Completed);
    assert_eq!(h.step_named(&wf.id, "Ship").await.status, StepStatus::Pending);

    assert!(matches!(h.engine.pause(&wf.id).await, Err(EngineError::Conflict(_))));
    assert!(matches!(
        h.engine.continue_workflow(&wf.id).await,
        Err(EngineError::Conflict(_))
    ));

    h.engine.resume(&wf.id).await.unwrap();
    assert!(matches!(h.engine.resume(&wf.id).await, Err(EngineError::Conflict(_))));
    *agent.target.lock().unwrap() = None;

    let summary = h.engine.continue_workflow(&wf.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.current_step, 2);
    assert!(stored.output_data.get("Work").is_some());
}

const REVIEW_FLOW: &str = r#"
name: "Code Review"
workflow_type: CODE_REVIEW
steps:
  - name: "Review"
    step_type: HUMAN_APPROVAL
  - name: "Merge"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["Review"]
  - name: "Lint"
    step_type: DELAY
    config:
      delay_seconds: 0
"#;

#[tokio::test]
async fn test_approval_parks_workflow_until_approved() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(REVIEW_FLOW, json!({})).await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Running);
    assert_eq!(summary.pending_steps, vec!["Review", "Merge"]);
    assert_eq!(summary.results["Review"]["status"], "pending_approval");
    assert!(summary.results.contains_key("Lint"));

    let review = h.step_named(&wf.id, "Review").await;
    assert!(review.is_awaiting_approval());
    assert_eq!(h.workflows.require(&wf.id).await.unwrap().current_step, 1);

    let merge = h.step_named(&wf.id, "Merge").await;
    assert!(matches!(
        h.engine.approve_step(&wf.id, &merge.id, "bob").await,
        Err(EngineError::Conflict(_))
    ));
    assert!(matches!(
        h.engine.approve_step("other", &review.id, "bob").await,
        Err(EngineError::NotFound(_))
    ));

    let approved = h.engine.approve_step(&wf.id, &review.id, "bob").await.unwrap();
    assert_eq!(approved.status, StepStatus::Completed);
    assert_eq!(h.workflows.require(&wf.id).await.unwrap().current_step, 2);

    let summary = h.engine.continue_workflow(&wf.id).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.output_data["Review"]["approved_by"], "bob");
    assert_eq!(stored.current_step, 3);
}

#[tokio::test]
async fn test_rejection_fails_workflow_and_rerun_asks_again() {
    let h = Harness::new();
    let wf = h.workflow_from_yaml(REVIEW_FLOW, json!({})).await;
    h.engine.execute_workflow(&wf.id, None).await.unwrap();

    let review = h.step_named(&wf.id, "Review").await;
    let rejected = h
        .engine
        .reject_step(&wf.id, &review.id, "carol", Some("needs tests"))
        .await
        .unwrap();
    assert_eq!(rejected.status, StepStatus::Failed);
    assert_eq!(rejected.error_message, "needs tests");

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert!(stored.error_message.unwrap().contains("needs tests"));

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Running);
    assert!(h.step_named(&wf.id, "Review").await.is_awaiting_approval());
}

#[tokio::test]
async fn test_false_condition_skips_dependents() {
    let h = Harness::new();
    let wf = h
        .workflow_from_yaml(
            r#"
name: "Release"
workflow_type: RELEASE
steps:
  - name: "Ready?"
    step_type: CONDITION
    config:
      condition: "tests_passed and coverage >= 80"
    input_data:
      tests_passed: true
      coverage: 61
  - name: "Deploy"
    step_type: WEBHOOK
    config:
      url: "https://deploy.example.com"
    depends_on: ["Ready?"]
  - name: "Announce"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["Deploy"]
  - name: "Changelog"
    step_type: DELAY
    config:
      delay_seconds: 0
"#,
            json!({}),
        )
        .await;

    let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(summary.results["Ready?"]["action"], "skip");
    assert_eq!(h.webhooks.calls(), 0);

    for name in ["Deploy", "Announce"] {
        let step = h.step_named(&wf.id, name).await;
        assert_eq!(step.status, StepStatus::Skipped, "{name} should be skipped");
    }

    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.current_step, 4);
    let mut keys: Vec<&String> = stored.output_data.as_object().unwrap().keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["Changelog", "Ready?"]);
}

#[tokio::test]
async fn test_cyclic_steps_stall_and_fail() {
    let h = Harness::new();
    let wf = h
        .workflow_from_yaml(
            r#"
name: "Loop"
steps:
  - name: "A"
    step_type: DELAY
    config:
      delay_seconds: 0
  - name: "B"
    step_type: DELAY
    config:
      delay_seconds: 0
    depends_on: ["A"]
  - name: "Free"
    step_type: DELAY
    config:
      delay_seconds: 0
"#,
            json!({}),
        )
        .await;
    // Close the loop behind the validator's back.
    let a = h.step_named(&wf.id, "A").await;
    let b = h.step_named(&wf.id, "B").await;
    h.steps.add_dependency(&a.id, &b.id).await.unwrap();

    let err = h.engine.execute_workflow(&wf.id, None).await.unwrap_err();
    match err {
        EngineError::DependencyStall(names) => assert_eq!(names, vec!["A", "B"]),
        other => panic!("unexpected error: {other:?}"),
    }
    let stored = h.workflows.require(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    assert_eq!(h.step_named(&wf.id, "Free").await.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_run_pending_by_priority() {
    let h = Harness::new();
    let yaml = r#"
name: "Tiny"
steps:
  - name: "Wait"
    step_type: DELAY
    config:
      delay_seconds: 0
"#;
    let low = h.workflow_from_yaml(yaml, json!({})).await;
    let urgent = h.workflow_from_yaml(yaml, json!({})).await;
    let normal = h.workflow_from_yaml(yaml, json!({})).await;
    h.workflows.update_priority(&low.id, 9).await.unwrap();
    h.workflows.update_priority(&urgent.id, 1).await.unwrap();

    let outcomes = h.engine.run_pending(2).await.unwrap();
    let mut ran: Vec<String> = outcomes.iter().map(|o| o.workflow_id.clone()).collect();
    ran.sort();
    let mut expected = vec![urgent.id.clone(), normal.id.clone()];
    expected.sort();
    assert_eq!(ran, expected);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    assert_eq!(h.workflows.require(&low.id).await.unwrap().status, WorkflowStatus::Pending);
    assert_eq!(h.workflows.require(&urgent.id).await.unwrap().status, WorkflowStatus::Completed);
}

/// Small deterministic PRNG so the DAG test needs no extra dependency.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[tokio::test]
async fn test_random_dags_run_in_topological_order() {
    for seed in 1..=8u64 {
        let mut rng = Lcg(seed);
        let n = 3 + rng.below(8) as usize;

        // rank[i] is the topological position of step i; deps only point to lower ranks.
        let mut rank: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = rng.below(i as u64 + 1) as usize;
            rank.swap(i, j);
        }

        let mut yaml = format!("name: \"DAG {}\"\nsteps:\n", seed);
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for j in 0..n {
                if rank[j] < rank[i] && rng.below(3) == 0 {
                    deps[i].push(j);
                }
            }
            yaml.push_str(&format!(
                "  - name: \"s{}\"\n    step_type: AGENT_TASK\n    config:\n      agent_type: \"worker\"\n",
                i
            ));
            if !deps[i].is_empty() {
                let names: Vec<String> = deps[i].iter().map(|d| format!("\"s{}\"", d)).collect();
                yaml.push_str(&format!("    depends_on: [{}]\n", names.join(", ")));
            }
        }

        let h = Harness::new();
        let wf = h.workflow_from_yaml(&yaml, json!({})).await;
        let summary = h.engine.execute_workflow(&wf.id, None).await.unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed, "seed {seed}");

        let ran = h.agents.ran();
        assert_eq!(ran.len(), n, "seed {seed}");
        let position: HashMap<&str, usize> =
            ran.iter().enumerate().map(|(p, name)| (name.as_str(), p)).collect();
        for (i, step_deps) in deps.iter().enumerate() {
            let me = position[format!("s{}", i).as_str()];
            for d in step_deps {
                let dep = position[format!("s{}", d).as_str()];
                assert!(dep < me, "seed {seed}: s{d} must run before s{i}");
            }
        }
    }
}
