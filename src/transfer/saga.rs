//! Transfer Saga
//!
//! Drives a transfer through `CREATED → DEBITED → CREDITED → COMPLETED`.
//! Each step runs in its own storage transaction through the
//! [`DurableExecutor`], and every transition is a compare-and-swap on the
//! persisted saga so concurrent drivers (request task, recovery worker)
//! never move a saga twice.

use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::executor::{DurableExecutor, StepOutput};
use super::ledger::{AccountLedger, precheck_accounts};
use super::publisher::EventPublisher;
use super::state::{SagaState, SagaStep};
use super::store::TransferStore;
use super::types::{
    SagaRecord, TransferEvent, TransferId, TransferParams, TransferRecord, TransferStatus,
};

/// Upper bound on `step` calls per `execute`
const MAX_ITERATIONS: usize = 100;

/// Error recorded on a saga moved to FAILED by `cancel`
pub(crate) const CANCELLED: &str = "cancelled";

/// What to do when the credit step fails after the sender was debited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationPolicy {
    /// Mark the saga FAILED and leave the sender debited
    #[default]
    None,
    /// Re-credit the sender and end in REVERSED
    Reverse,
}

pub struct TransferSaga {
    store: Arc<dyn TransferStore>,
    executor: Arc<dyn DurableExecutor>,
    publisher: Option<Arc<dyn EventPublisher>>,
    compensation: CompensationPolicy,
}

impl TransferSaga {
    pub fn new(
        store: Arc<dyn TransferStore>,
        executor: Arc<dyn DurableExecutor>,
        publisher: Option<Arc<dyn EventPublisher>>,
        compensation: CompensationPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            publisher,
            compensation,
        }
    }

    /// Validate, pre-check both accounts and persist a CREATED saga
    pub async fn start(&self, params: TransferParams) -> Result<TransferId, TransferError> {
        params.validate()?;
        precheck_accounts(self.store.as_ref(), &params).await?;

        let saga = SagaRecord::new(TransferId::new(), params);
        self.store.create_saga(&saga).await?;
        info!(
            transfer_id = %saga.saga_id,
            amount = saga.params.amount,
            currency = %saga.params.currency,
            "Saga created: {} -> {}", saga.params.sender, saga.params.recipient
        );

        Ok(saga.saga_id)
    }

    /// Advance the saga by at most one state and return the new state.
    /// Call repeatedly until a terminal state is reached.
    pub async fn step(&self, saga_id: TransferId) -> Result<SagaState, TransferError> {
        let saga = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(saga_id.to_string()))?;

        if saga.state.is_terminal() {
            return Ok(saga.state);
        }

        let new_state = match saga.state {
            SagaState::Created => self.step_created(&saga).await?,
            SagaState::Debited => self.step_debited(&saga).await?,
            SagaState::Credited => self.step_credited(&saga).await?,
            SagaState::Compensating => self.step_compensating(&saga).await?,
            _ => saga.state,
        };

        if !new_state.is_terminal() && new_state == saga.state {
            self.store.increment_saga_retry(saga_id).await?;
        }

        Ok(new_state)
    }

    /// Run `step` until a terminal state or the iteration cap
    pub async fn execute(&self, saga_id: TransferId) -> Result<SagaState, TransferError> {
        let mut state = SagaState::Created;

        for i in 0..MAX_ITERATIONS {
            let previous = state;
            state = self.step(saga_id).await?;

            if state.is_terminal() {
                debug!(
                    transfer_id = %saga_id,
                    state = %state,
                    iterations = i + 1,
                    "Saga finished"
                );
                return Ok(state);
            }

            // Back off only when a step made no progress
            if state == previous {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }

        warn!(
            transfer_id = %saga_id,
            state = %state,
            "Saga did not finish within iteration limit"
        );
        Ok(state)
    }

    /// Cancel a saga that has not debited yet
    pub async fn cancel(&self, saga_id: TransferId) -> Result<(), TransferError> {
        let saga = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(saga_id.to_string()))?;

        if !saga.state.is_cancellable() {
            return Err(TransferError::InvalidStateTransition(format!(
                "cannot cancel saga {} in state {}",
                saga_id, saga.state
            )));
        }
        if self.store.step_output(saga_id, SagaStep::Debit).await?.is_some() {
            return Err(TransferError::InvalidStateTransition(format!(
                "saga {} already debited",
                saga_id
            )));
        }

        if !self
            .store
            .update_saga_state_if(
                saga_id,
                SagaState::Created,
                SagaState::Failed,
                Some(CANCELLED),
            )
            .await?
        {
            let current = self.current_state(saga_id).await?;
            return Err(TransferError::InvalidStateTransition(format!(
                "saga {} moved to {} before cancel",
                saga_id, current
            )));
        }

        info!(transfer_id = %saga_id, "Saga cancelled");
        Ok(())
    }

    pub async fn get(&self, saga_id: TransferId) -> Result<Option<SagaRecord>, TransferError> {
        self.store.get_saga(saga_id).await
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub fn compensation(&self) -> CompensationPolicy {
        self.compensation
    }

    // ========================================================================
    // State handlers
    // ========================================================================

    /// CREATED: debit the sender
    async fn step_created(&self, saga: &SagaRecord) -> Result<SagaState, TransferError> {
        let body = move || self.debit(saga).boxed();
        let result = self
            .executor
            .run_step(saga.saga_id, SagaStep::Debit, &body)
            .await;

        match result {
            Ok(_) => {
                if self
                    .store
                    .update_saga_state_if(saga.saga_id, SagaState::Created, SagaState::Debited, None)
                    .await?
                {
                    return Ok(SagaState::Debited);
                }

                // Lost the CAS. Only a cancel that landed while the debit was
                // in flight is reversed here; other FAILED sagas stay as they are.
                let current = self
                    .store
                    .get_saga(saga.saga_id)
                    .await?
                    .ok_or_else(|| TransferError::TransferNotFound(saga.saga_id.to_string()))?;
                if current.state == SagaState::Failed && current.error.as_deref() == Some(CANCELLED)
                {
                    error!(
                        transfer_id = %saga.saga_id,
                        "Sender debited after cancellation, reversing"
                    );
                    if let Err(e) = self.run_reverse(saga).await {
                        error!(
                            transfer_id = %saga.saga_id,
                            sender = %saga.params.sender,
                            amount = saga.params.amount,
                            error = %e,
                            "Reversal of cancelled saga failed, manual re-credit required"
                        );
                    }
                }
                Ok(current.state)
            }
            Err(e) => {
                // A timed-out attempt may still have committed
                if self
                    .store
                    .step_output(saga.saga_id, SagaStep::Debit)
                    .await?
                    .is_some()
                {
                    return self
                        .advance(saga.saga_id, SagaState::Created, SagaState::Debited, None)
                        .await;
                }

                info!(transfer_id = %saga.saga_id, error = %e, "Debit failed, saga aborted");
                self.advance(
                    saga.saga_id,
                    SagaState::Created,
                    SagaState::Failed,
                    Some(&e.to_string()),
                )
                .await
            }
        }
    }

    /// DEBITED: credit the recipient and write the COMPLETED record.
    ///
    /// Funds are in flight here: the sender is debited and nobody holds them.
    async fn step_debited(&self, saga: &SagaRecord) -> Result<SagaState, TransferError> {
        let body = move || self.credit(saga).boxed();
        let result = self
            .executor
            .run_step(saga.saga_id, SagaStep::Credit, &body)
            .await;

        let e = match result {
            Ok(_) => {
                return self
                    .advance(saga.saga_id, SagaState::Debited, SagaState::Credited, None)
                    .await;
            }
            Err(e) => e,
        };

        if self
            .store
            .step_output(saga.saga_id, SagaStep::Credit)
            .await?
            .is_some()
        {
            return self
                .advance(saga.saga_id, SagaState::Debited, SagaState::Credited, None)
                .await;
        }

        match self.compensation {
            CompensationPolicy::None => {
                error!(
                    transfer_id = %saga.saga_id,
                    sender = %saga.params.sender,
                    amount = saga.params.amount,
                    error = %e,
                    "Credit failed after debit; sender stays debited (compensation disabled)"
                );
                self.advance(
                    saga.saga_id,
                    SagaState::Debited,
                    SagaState::Failed,
                    Some(&e.to_string()),
                )
                .await
            }
            CompensationPolicy::Reverse => {
                warn!(transfer_id = %saga.saga_id, error = %e, "Credit failed, compensating");
                self.advance(
                    saga.saga_id,
                    SagaState::Debited,
                    SagaState::Compensating,
                    Some(&e.to_string()),
                )
                .await
            }
        }
    }

    /// CREDITED: announce completion. Money has moved; never compensates.
    async fn step_credited(&self, saga: &SagaRecord) -> Result<SagaState, TransferError> {
        let body = move || self.publish(saga).boxed();
        match self
            .executor
            .run_step(saga.saga_id, SagaStep::Publish, &body)
            .await
        {
            Ok(_) => {
                let state = self
                    .advance(saga.saga_id, SagaState::Credited, SagaState::Completed, None)
                    .await?;
                if state == SagaState::Completed {
                    info!(transfer_id = %saga.saga_id, "Transfer completed");
                }
                Ok(state)
            }
            Err(e) => {
                warn!(
                    transfer_id = %saga.saga_id,
                    error = %e,
                    "Completion event not delivered; transfer stays COMPLETED"
                );
                self.advance(
                    saga.saga_id,
                    SagaState::Credited,
                    SagaState::Failed,
                    Some(&e.to_string()),
                )
                .await
            }
        }
    }

    /// COMPENSATING: re-credit the sender, retried until it succeeds
    async fn step_compensating(&self, saga: &SagaRecord) -> Result<SagaState, TransferError> {
        match self.run_reverse(saga).await {
            Ok(()) => {
                let state = self
                    .advance(
                        saga.saga_id,
                        SagaState::Compensating,
                        SagaState::Reversed,
                        None,
                    )
                    .await?;
                if state == SagaState::Reversed {
                    info!(transfer_id = %saga.saga_id, "Transfer reversed");
                }
                Ok(state)
            }
            Err(e) => {
                warn!(
                    transfer_id = %saga.saga_id,
                    error = %e,
                    "Reversal failed (will retry)"
                );
                Ok(SagaState::Compensating)
            }
        }
    }

    async fn run_reverse(&self, saga: &SagaRecord) -> Result<(), TransferError> {
        let body = move || self.reverse(saga).boxed();
        self.executor
            .run_step(saga.saga_id, SagaStep::Reverse, &body)
            .await
            .map(|_| ())
    }

    /// CAS `from → to`; on a lost race return whatever state won
    async fn advance(
        &self,
        saga_id: TransferId,
        from: SagaState,
        to: SagaState,
        error: Option<&str>,
    ) -> Result<SagaState, TransferError> {
        if self
            .store
            .update_saga_state_if(saga_id, from, to, error)
            .await?
        {
            debug!(transfer_id = %saga_id, from = %from, to = %to, "Saga transition");
            return Ok(to);
        }
        self.current_state(saga_id).await
    }

    async fn current_state(&self, saga_id: TransferId) -> Result<SagaState, TransferError> {
        match self.store.get_saga(saga_id).await? {
            Some(s) => Ok(s.state),
            None => {
                error!(
                    transfer_id = %saga_id,
                    "Saga not found after CAS failure (data corruption?)"
                );
                Err(TransferError::TransferNotFound(saga_id.to_string()))
            }
        }
    }

    // ========================================================================
    // Step bodies (each one storage transaction, step log written inside it)
    // ========================================================================

    async fn debit(&self, saga: &SagaRecord) -> Result<StepOutput, TransferError> {
        let p = &saga.params;
        let mut tx = self.store.begin().await?;

        // Lock first: a concurrent driver of the same saga waits here and then
        // sees our step-log row
        AccountLedger::new(tx.as_mut())
            .lock_and_get(&p.sender, &p.currency)
            .await?;
        if let Some(raw) = tx.step_output(saga.saga_id, SagaStep::Debit).await? {
            tx.rollback().await?;
            return StepOutput::decode(&raw);
        }

        let sender = AccountLedger::new(tx.as_mut())
            .debit(&p.sender, &p.currency, p.amount)
            .await?;
        let output = StepOutput::Debited {
            balance_after: sender.balance,
        };
        tx.record_step(saga.saga_id, SagaStep::Debit, &output.encode()?)
            .await?;
        tx.commit().await?;

        debug!(transfer_id = %saga.saga_id, balance_after = sender.balance, "Sender debited");
        Ok(output)
    }

    async fn credit(&self, saga: &SagaRecord) -> Result<StepOutput, TransferError> {
        let p = &saga.params;
        let mut tx = self.store.begin().await?;

        AccountLedger::new(tx.as_mut())
            .lock_and_get(&p.recipient, &p.currency)
            .await?;
        if let Some(raw) = tx.step_output(saga.saga_id, SagaStep::Credit).await? {
            tx.rollback().await?;
            return StepOutput::decode(&raw);
        }

        AccountLedger::new(tx.as_mut())
            .credit(&p.recipient, &p.currency, p.amount)
            .await?;
        let record = TransferRecord::new(saga.saga_id, p, TransferStatus::Completed);
        tx.insert_transfer(&record).await?;

        let output = StepOutput::Credited { record };
        tx.record_step(saga.saga_id, SagaStep::Credit, &output.encode()?)
            .await?;
        tx.commit().await?;

        debug!(transfer_id = %saga.saga_id, "Recipient credited");
        Ok(output)
    }

    async fn publish(&self, saga: &SagaRecord) -> Result<StepOutput, TransferError> {
        let Some(publisher) = &self.publisher else {
            debug!(transfer_id = %saga.saga_id, "No publisher configured, skipping event");
            return Ok(StepOutput::Published);
        };

        let record = self
            .store
            .get_transfer(saga.saga_id)
            .await?
            .ok_or_else(|| {
                TransferError::SystemError(format!("no record for credited saga {}", saga.saga_id))
            })?;
        publisher.publish(&TransferEvent::from(&record)).await?;
        Ok(StepOutput::Published)
    }

    async fn reverse(&self, saga: &SagaRecord) -> Result<StepOutput, TransferError> {
        let p = &saga.params;
        let mut tx = self.store.begin().await?;

        AccountLedger::new(tx.as_mut())
            .lock_and_get(&p.sender, &p.currency)
            .await?;
        if let Some(raw) = tx.step_output(saga.saga_id, SagaStep::Reverse).await? {
            tx.rollback().await?;
            return StepOutput::decode(&raw);
        }
        if tx.step_output(saga.saga_id, SagaStep::Debit).await?.is_none() {
            return Err(TransferError::SystemError(format!(
                "saga {} has no debit to reverse",
                saga.saga_id
            )));
        }

        AccountLedger::new(tx.as_mut())
            .credit(&p.sender, &p.currency, p.amount)
            .await?;
        let record = TransferRecord::new(saga.saga_id, p, TransferStatus::Reversed);
        tx.insert_transfer(&record).await?;

        let output = StepOutput::Reversed { record };
        tx.record_step(saga.saga_id, SagaStep::Reverse, &output.encode()?)
            .await?;
        tx.commit().await?;

        debug!(transfer_id = %saga.saga_id, "Sender re-credited");
        Ok(output)
    }
}
