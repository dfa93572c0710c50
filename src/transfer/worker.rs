//! Recovery Worker
//!
//! Background worker that scans for and resumes stuck sagas.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::saga::TransferSaga;
use super::state::SagaState;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale sagas
    pub scan_interval: Duration,
    /// How long a saga must be untouched to be considered stale
    pub stale_threshold: Duration,
    /// Maximum sagas to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Retries after which a compensating saga is reported
const COMPENSATING_ALERT_RETRIES: i32 = 10;

/// Recovery Worker
///
/// Periodically picks up sagas left in a non-terminal state (crashed
/// process, dropped driver task) and drives them to a terminal state.
pub struct RecoveryWorker {
    saga: Arc<TransferSaga>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(saga: Arc<TransferSaga>, config: WorkerConfig) -> Self {
        Self { saga, config }
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan and recovery cycle; returns sagas that reached a
    /// terminal state
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        let stale = self
            .saga
            .store()
            .find_stale_sagas(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("No stale sagas found");
            return Ok(0);
        }

        info!(count = stale.len(), "Found stale sagas to recover");

        let mut recovered = 0;

        for saga in &stale {
            debug!(
                transfer_id = %saga.saga_id,
                state = %saga.state,
                in_flight = saga.state.is_in_flight(),
                retry_count = saga.retry_count,
                "Recovering saga"
            );

            if saga.state == SagaState::Compensating
                && saga.retry_count > COMPENSATING_ALERT_RETRIES
            {
                warn!(
                    transfer_id = %saga.saga_id,
                    retry_count = saga.retry_count,
                    sender = %saga.params.sender,
                    amount = saga.params.amount,
                    "CRITICAL: Saga stuck in COMPENSATING with many retries!"
                );
            }

            match self.saga.execute(saga.saga_id).await {
                Ok(new_state) => {
                    if new_state != saga.state {
                        info!(
                            transfer_id = %saga.saga_id,
                            old_state = %saga.state,
                            new_state = %new_state,
                            "Saga state advanced"
                        );
                    }
                    if new_state.is_terminal() {
                        recovered += 1;
                    }
                }
                Err(e) => {
                    error!(
                        transfer_id = %saga.saga_id,
                        error = %e,
                        "Failed to recover saga"
                    );
                }
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered sagas this scan");
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }
}
