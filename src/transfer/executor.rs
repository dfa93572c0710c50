//! Durable Step Execution
//!
//! [`DurableExecutor`] runs one saga step for a `(saga_id, step)` pair at
//! least once and persists success before returning it, so a resumed saga
//! skips steps that already completed.
//!
//! [`StepLogExecutor`] is the built-in engine: a step-log table in the same
//! store, a bounded retry loop and a per-attempt timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::TransferError;
use super::state::SagaStep;
use super::store::TransferStore;
use super::types::{TransferId, TransferRecord};

/// Result of a completed step, persisted as JSON in the step log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Debited { balance_after: i64 },
    Credited { record: TransferRecord },
    Published,
    Reversed { record: TransferRecord },
}

impl StepOutput {
    pub fn encode(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Step retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per step (first try included)
    pub max_attempts: u32,
    /// Upper bound on a single attempt
    pub step_timeout: Duration,
    /// Delay before the second attempt; doubles per attempt
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub type StepFuture<'a> = BoxFuture<'a, Result<StepOutput, TransferError>>;

/// Step body; may be invoked more than once
pub type StepFn<'a> = &'a (dyn Fn() -> StepFuture<'a> + Send + Sync);

#[async_trait]
pub trait DurableExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute `body` at least once for `(saga_id, step)` and persist its
    /// success before returning it.
    async fn run_step<'a>(
        &'a self,
        saga_id: TransferId,
        step: SagaStep,
        body: StepFn<'a>,
    ) -> Result<StepOutput, TransferError>;
}

/// Step-log backed executor
pub struct StepLogExecutor {
    store: Arc<dyn TransferStore>,
    policy: RetryPolicy,
}

impl StepLogExecutor {
    pub fn new(store: Arc<dyn TransferStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl DurableExecutor for StepLogExecutor {
    fn name(&self) -> &'static str {
        "step-log"
    }

    async fn run_step<'a>(
        &'a self,
        saga_id: TransferId,
        step: SagaStep,
        body: StepFn<'a>,
    ) -> Result<StepOutput, TransferError> {
        if let Some(raw) = self.store.step_output(saga_id, step).await? {
            debug!(saga_id = %saga_id, step = %step, "Step already completed, skipping");
            return StepOutput::decode(&raw);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.policy.step_timeout, body()).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout(format!(
                    "{} exceeded {:?}",
                    step, self.policy.step_timeout
                ))),
            };

            match result {
                Ok(output) => {
                    self.store
                        .record_step(saga_id, step, &output.encode()?)
                        .await?;
                    debug!(saga_id = %saga_id, step = %step, attempt, "Step completed");
                    return Ok(output);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        saga_id = %saga_id,
                        step = %step,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        saga_id = %saga_id,
                        step = %step,
                        attempt,
                        error = %e,
                        "Step failed permanently"
                    );
                    return Err(e);
                }
            }
        }
    }
}
