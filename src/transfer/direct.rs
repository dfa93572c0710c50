//! Direct transfer path
//!
//! One storage transaction: lock both accounts in id order, move the money,
//! write the COMPLETED record, commit. Publishing happens afterwards on a
//! detached task and can never undo the transfer.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::TransferError;
use super::ledger::{AccountLedger, precheck_accounts};
use super::publisher::EventPublisher;
use super::store::TransferStore;
use super::types::{TransferEvent, TransferId, TransferParams, TransferRecord, TransferStatus};

pub struct DirectTransfer {
    store: Arc<dyn TransferStore>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl DirectTransfer {
    pub fn new(store: Arc<dyn TransferStore>, publisher: Option<Arc<dyn EventPublisher>>) -> Self {
        Self { store, publisher }
    }

    pub async fn transfer(&self, params: TransferParams) -> Result<TransferRecord, TransferError> {
        params.validate()?;
        precheck_accounts(self.store.as_ref(), &params).await?;

        let id = TransferId::new();
        let mut tx = self.store.begin().await?;
        {
            let mut ledger = AccountLedger::new(tx.as_mut());
            let (sender, recipient) = ledger
                .lock_pair(&params.sender, &params.recipient, &params.currency)
                .await?;

            if sender.balance < params.amount {
                debug!(
                    transfer_id = %id,
                    balance = sender.balance,
                    amount = params.amount,
                    "Insufficient funds"
                );
                return Err(TransferError::InsufficientFunds);
            }

            let recipient_after = recipient.balance.checked_add(params.amount).ok_or_else(|| {
                TransferError::Validation(format!("balance overflow on {}", recipient.id))
            })?;
            ledger
                .update_balance(&sender.id, sender.balance - params.amount)
                .await?;
            ledger.update_balance(&recipient.id, recipient_after).await?;
        }

        let record = TransferRecord::new(id, &params, TransferStatus::Completed);
        tx.insert_transfer(&record).await?;
        tx.commit().await?;

        info!(
            transfer_id = %id,
            amount = params.amount,
            currency = %params.currency,
            "Transfer completed: {} -> {}", params.sender, params.recipient
        );

        self.publish_detached(&record);
        Ok(record)
    }

    /// Fire-and-forget publish; failures are logged only
    fn publish_detached(&self, record: &TransferRecord) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let event = TransferEvent::from(record);
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&event).await {
                warn!(
                    transfer_id = %event.transaction_id,
                    publisher = publisher.name(),
                    error = %e,
                    "Completion event dropped"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::publisher::RecordingPublisher;
    use crate::transfer::store::MemoryStore;
    use std::time::Duration;

    fn setup(accounts: &[(&str, &str, i64)]) -> (DirectTransfer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (id, currency, balance) in accounts {
            store
                .open_account(id, &format!("user_{}", id), currency, *balance)
                .unwrap();
        }
        (DirectTransfer::new(store.clone(), None), store)
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_records() {
        let (direct, store) = setup(&[("alice", "IDR", 1_000_000), ("bob", "IDR", 500_000)]);

        let params = TransferParams::new("alice", "bob", 200_000, "IDR", None).unwrap();
        let record = direct.transfer(params).await.unwrap();

        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(store.balance("alice"), Some(800_000));
        assert_eq!(store.balance("bob"), Some(700_000));
        assert_eq!(store.get_transfer(record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_insufficient_funds_is_noop() {
        let (direct, store) = setup(&[("alice", "IDR", 100), ("bob", "IDR", 0)]);

        let params = TransferParams::new("alice", "bob", 200, "IDR", None).unwrap();
        assert_eq!(
            direct.transfer(params).await,
            Err(TransferError::InsufficientFunds)
        );
        assert_eq!(store.balance("alice"), Some(100));
        assert_eq!(store.balance("bob"), Some(0));
    }

    #[tokio::test]
    async fn test_currency_mismatch_rejected_before_locking() {
        let (direct, store) = setup(&[("alice", "IDR", 100), ("bob", "USD", 0)]);

        let params = TransferParams::new("alice", "bob", 50, "IDR", None).unwrap();
        assert!(matches!(
            direct.transfer(params).await,
            Err(TransferError::Validation(_))
        ));
        assert_eq!(store.balance("alice"), Some(100));
    }

    #[cfg(feature = "fault-injection")]
    #[tokio::test]
    async fn test_commit_failure_rolls_back_everything() {
        let (direct, store) = setup(&[("alice", "IDR", 100), ("bob", "IDR", 0)]);
        store.fail_next_commits(1);

        let params = TransferParams::new("alice", "bob", 50, "IDR", None).unwrap();
        assert!(matches!(
            direct.transfer(params).await,
            Err(TransferError::TransientStore(_))
        ));
        assert_eq!(store.balance("alice"), Some(100));
        assert_eq!(store.balance("bob"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_undo_transfer() {
        let store = Arc::new(MemoryStore::new());
        store.open_account("alice", "u1", "IDR", 100).unwrap();
        store.open_account("bob", "u2", "IDR", 0).unwrap();
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.fail_next(1);
        let direct = DirectTransfer::new(store.clone(), Some(publisher.clone()));

        let params = TransferParams::new("alice", "bob", 60, "IDR", None).unwrap();
        let record = direct.transfer(params).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.attempts(), 1);
        assert!(publisher.events().is_empty());
        assert_eq!(store.balance("alice"), Some(40));
        assert_eq!(store.balance("bob"), Some(60));
    }
}
