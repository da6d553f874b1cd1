//! Retry controller for step attempts.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::models::step::{StepStatus, WorkflowStep};
use crate::store::StepStore;

use super::executor::StepContext;

/// Exponential backoff between attempts of the same step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Retry straight away. Used by tests and by callers that schedule their own waits.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Wait before retry number `retry` (1-based): `initial * multiplier^(retry-1)`, capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = retry.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

/// One attempt at running a step. Implemented by the step executor; tests plug in fakes.
#[async_trait]
pub trait StepAttempt: Send + Sync {
    async fn attempt(&self, step: &mut WorkflowStep, ctx: &StepContext) -> Result<Value, EngineError>;
}

/// Re-invokes a failing step until its retry budget is spent.
#[derive(Clone)]
pub struct RetryController {
    steps: StepStore,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(steps: StepStore, policy: RetryPolicy) -> Self {
        Self { steps, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `runner` for `step`, retrying retryable failures while
    /// `retry_count < max_retries`. Each retry is persisted before the next attempt.
    ///
    /// When the budget is spent the step is stored FAILED with its error message
    /// and `StepExecution` is returned. Cancellation is returned untouched so the
    /// caller can put the step back to PENDING.
    pub async fn run_with_retry<R>(
        &self,
        step: &mut WorkflowStep,
        ctx: &StepContext,
        runner: &R,
    ) -> Result<Value, EngineError>
    where
        R: StepAttempt + ?Sized,
    {
        loop {
            let err = match runner.attempt(step, ctx).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if matches!(err, EngineError::Cancelled(_) | EngineError::Database(_)) {
                return Err(err);
            }
            if !err.is_retryable() {
                tracing::error!("[Retry] Step '{}' failed permanently: {}", step.name, err);
                self.mark_failed(step, err.to_string()).await?;
                return Err(err);
            }

            if step.retry_count >= step.max_retries {
                let message = err.to_string();
                tracing::error!(
                    "[Retry] Step '{}' failed after {} retries: {}",
                    step.name,
                    step.retry_count,
                    message
                );
                self.mark_failed(step, message.clone()).await?;
                return Err(EngineError::StepExecution {
                    step_id: step.id.clone(),
                    retry_count: step.retry_count,
                    message,
                });
            }

            step.retry_count += 1;
            step.error_message = err.to_string();
            self.steps.save(step).await?;

            let wait = self.policy.backoff_for(step.retry_count);
            tracing::warn!(
                "[Retry] Step '{}' failed ({}), retry {}/{} in {:?}",
                step.name,
                err,
                step.retry_count,
                step.max_retries,
                wait
            );
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(EngineError::Cancelled(format!(
                            "Step '{}' cancelled while waiting to retry",
                            step.name
                        )));
                    }
                }
            }
        }
    }

    async fn mark_failed(&self, step: &mut WorkflowStep, message: String) -> Result<(), EngineError> {
        step.status = StepStatus::Failed;
        step.error_message = message;
        self.steps.save(step).await
    }
}
