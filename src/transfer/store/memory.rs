//! In-Memory Transfer Store
//!
//! Single-process engine with the same locking contract as PostgreSQL:
//! - each account row carries an async mutex; a `MemoryLedgerTx` holds the
//!   owned guard until commit/rollback/drop (`SELECT ... FOR UPDATE`)
//! - writes are staged inside the scope and applied at commit while the
//!   guards are still held
//! - plain reads see the last committed balance and never block (MVCC-like)

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{LedgerTx, TransferStore};
use crate::transfer::error::TransferError;
use crate::transfer::state::{SagaState, SagaStep};
use crate::transfer::types::{Account, AccountId, Currency, SagaRecord, TransferId, TransferRecord};

struct AccountRow {
    owner: String,
    currency: Currency,
    row_lock: Arc<Mutex<()>>,
    committed: Arc<AtomicI64>,
}

#[derive(Default)]
struct Faults {
    commits: AtomicU32,
    locks: AtomicU32,
}

impl Faults {
    /// Consume one pending fault, if any
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
struct Inner {
    accounts: DashMap<AccountId, AccountRow>,
    transfers: DashMap<TransferId, TransferRecord>,
    sagas: DashMap<TransferId, SagaRecord>,
    steps: DashMap<(TransferId, SagaStep), String>,
    commit_gate: StdMutex<()>,
    faults: Faults,
}

/// In-memory store; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an account (outside the transfer core proper)
    pub fn open_account(
        &self,
        id: &str,
        owner: &str,
        currency: &str,
        balance: i64,
    ) -> Result<Account, TransferError> {
        if balance < 0 {
            return Err(TransferError::Validation(
                "opening balance must be non-negative".to_string(),
            ));
        }
        let account = Account {
            id: AccountId::new(id),
            owner: owner.to_string(),
            balance,
            currency: Currency::parse(currency)?,
        };

        if self.inner.accounts.contains_key(&account.id) {
            return Err(TransferError::Database(format!(
                "duplicate key accounts_tb: {}",
                id
            )));
        }
        self.inner.accounts.insert(
            account.id.clone(),
            AccountRow {
                owner: account.owner.clone(),
                currency: account.currency.clone(),
                row_lock: Arc::new(Mutex::new(())),
                committed: Arc::new(AtomicI64::new(balance)),
            },
        );
        Ok(account)
    }

    /// Last committed balance
    pub fn balance(&self, id: &str) -> Option<i64> {
        self.inner
            .accounts
            .get(&AccountId::new(id))
            .map(|row| row.committed.load(Ordering::SeqCst))
    }

    /// Make the next `n` commits fail with a transient error (scope rolled back)
    #[cfg(feature = "fault-injection")]
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.faults.commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` row-lock attempts fail with a transient error
    #[cfg(feature = "fault-injection")]
    pub fn fail_next_locks(&self, n: u32) {
        self.inner.faults.locks.store(n, Ordering::SeqCst);
    }
}

struct LockedRow {
    _guard: OwnedMutexGuard<()>,
    committed: Arc<AtomicI64>,
    account: Account,
    dirty: bool,
}

/// Transactional scope over [`MemoryStore`]
pub struct MemoryLedgerTx {
    inner: Arc<Inner>,
    locked: HashMap<AccountId, LockedRow>,
    transfers: Vec<TransferRecord>,
    steps: Vec<((TransferId, SagaStep), String)>,
}

impl MemoryLedgerTx {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            locked: HashMap::new(),
            transfers: Vec::new(),
            steps: Vec::new(),
        }
    }

    fn staged_step(&self, key: &(TransferId, SagaStep)) -> Option<String> {
        self.steps
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, output)| output.clone())
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_account(
        &mut self,
        id: &AccountId,
        currency: &Currency,
    ) -> Result<Option<Account>, TransferError> {
        if let Some(row) = self.locked.get(id) {
            return Ok((row.account.currency == *currency).then(|| row.account.clone()));
        }

        if Faults::take(&self.inner.faults.locks) {
            return Err(TransferError::TransientStore(format!(
                "injected lock failure on {}",
                id
            )));
        }

        let (row_lock, committed, owner) = match self.inner.accounts.get(id) {
            Some(row) if row.currency == *currency => (
                row.row_lock.clone(),
                row.committed.clone(),
                row.owner.clone(),
            ),
            _ => return Ok(None),
        };

        let guard = row_lock.lock_owned().await;
        let account = Account {
            id: id.clone(),
            owner,
            balance: committed.load(Ordering::SeqCst),
            currency: currency.clone(),
        };

        self.locked.insert(
            id.clone(),
            LockedRow {
                _guard: guard,
                committed,
                account: account.clone(),
                dirty: false,
            },
        );
        Ok(Some(account))
    }

    async fn update_balance(&mut self, id: &AccountId, balance: i64) -> Result<(), TransferError> {
        let row = self.locked.get_mut(id).ok_or_else(|| {
            TransferError::SystemError(format!("balance update on {} without row lock", id))
        })?;
        if balance < 0 {
            return Err(TransferError::Database(format!(
                "check constraint violated: balance >= 0 on {}",
                id
            )));
        }
        row.account.balance = balance;
        row.dirty = true;
        Ok(())
    }

    async fn insert_transfer(&mut self, record: &TransferRecord) -> Result<(), TransferError> {
        let duplicate = self.inner.transfers.contains_key(&record.id)
            || self.transfers.iter().any(|r| r.id == record.id);
        if duplicate {
            return Err(TransferError::Database(format!(
                "duplicate key transfers_tb: {}",
                record.id
            )));
        }
        self.transfers.push(record.clone());
        Ok(())
    }

    async fn step_output(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError> {
        let key = (saga_id, step);
        if let Some(output) = self.staged_step(&key) {
            return Ok(Some(output));
        }
        Ok(self.inner.steps.get(&key).map(|o| o.clone()))
    }

    async fn record_step(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError> {
        let key = (saga_id, step);
        if self.inner.steps.contains_key(&key) || self.staged_step(&key).is_some() {
            return Ok(false);
        }
        self.steps.push((key, output.to_string()));
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        if Faults::take(&self.inner.faults.commits) {
            return Err(TransferError::TransientStore(
                "injected commit failure".to_string(),
            ));
        }

        let _gate = self
            .inner
            .commit_gate
            .lock()
            .map_err(|_| TransferError::SystemError("commit gate poisoned".to_string()))?;

        if let Some(dup) = self
            .transfers
            .iter()
            .find(|r| self.inner.transfers.contains_key(&r.id))
        {
            return Err(TransferError::Database(format!(
                "duplicate key transfers_tb: {}",
                dup.id
            )));
        }

        for row in self.locked.values().filter(|row| row.dirty) {
            row.committed.store(row.account.balance, Ordering::SeqCst);
        }
        for record in &self.transfers {
            self.inner.transfers.insert(record.id, record.clone());
        }
        for (key, output) in &self.steps {
            self.inner
                .steps
                .entry(*key)
                .or_insert_with(|| output.clone());
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TransferError> {
        debug!(locked = self.locked.len(), "Memory transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, TransferError> {
        Ok(Box::new(MemoryLedgerTx::new(self.inner.clone())))
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, TransferError> {
        Ok(self.inner.accounts.get(id).map(|row| Account {
            id: id.clone(),
            owner: row.owner.clone(),
            balance: row.committed.load(Ordering::SeqCst),
            currency: row.currency.clone(),
        }))
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        Ok(self.inner.transfers.get(&id).map(|r| r.clone()))
    }

    async fn create_saga(&self, saga: &SagaRecord) -> Result<(), TransferError> {
        if self.inner.sagas.contains_key(&saga.saga_id) {
            return Err(TransferError::Database(format!(
                "duplicate key transfer_sagas_tb: {}",
                saga.saga_id
            )));
        }
        self.inner.sagas.insert(saga.saga_id, saga.clone());
        Ok(())
    }

    async fn get_saga(&self, saga_id: TransferId) -> Result<Option<SagaRecord>, TransferError> {
        Ok(self.inner.sagas.get(&saga_id).map(|s| s.clone()))
    }

    async fn update_saga_state_if(
        &self,
        saga_id: TransferId,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&str>,
    ) -> Result<bool, TransferError> {
        match self.inner.sagas.get_mut(&saga_id) {
            Some(mut saga) if saga.state == expected => {
                saga.state = new_state;
                if let Some(e) = error {
                    saga.error = Some(e.to_string());
                }
                saga.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_saga_retry(&self, saga_id: TransferId) -> Result<(), TransferError> {
        if let Some(mut saga) = self.inner.sagas.get_mut(&saga_id) {
            saga.retry_count += 1;
            saga.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_stale_sagas(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| TransferError::SystemError(format!("stale threshold: {}", e)))?;
        let cutoff = Utc::now() - threshold;

        let mut stale: Vec<SagaRecord> = self
            .inner
            .sagas
            .iter()
            .filter(|s| !s.state.is_terminal() && s.updated_at <= cutoff)
            .map(|s| s.clone())
            .collect();
        stale.sort_by_key(|s| s.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn step_output(
        &self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError> {
        Ok(self.inner.steps.get(&(saga_id, step)).map(|o| o.clone()))
    }

    async fn record_step(
        &self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError> {
        let mut inserted = false;
        self.inner.steps.entry((saga_id, step)).or_insert_with(|| {
            inserted = true;
            output.to_string()
        });
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::{TransferParams, TransferStatus};

    fn idr() -> Currency {
        Currency::parse("IDR").unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_staged_balance() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 1_000).unwrap();
        let id = AccountId::new("a");

        let mut tx = store.begin().await.unwrap();
        let account = tx.lock_account(&id, &idr()).await.unwrap().unwrap();
        tx.update_balance(&id, account.balance - 300).await.unwrap();

        // Uncommitted write is invisible to plain readers
        assert_eq!(store.balance("a"), Some(1_000));

        tx.commit().await.unwrap();
        assert_eq!(store.balance("a"), Some(700));
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 1_000).unwrap();
        let id = AccountId::new("a");

        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_account(&id, &idr()).await.unwrap();
            tx.update_balance(&id, 0).await.unwrap();
        }
        assert_eq!(store.balance("a"), Some(1_000));

        // Lock was released by the drop
        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_account(&id, &idr()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_scope() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 1_000).unwrap();
        let id = AccountId::new("a");

        let mut first = store.begin().await.unwrap();
        first.lock_account(&id, &idr()).await.unwrap();

        let contender = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                let seen = second.lock_account(&id, &idr()).await.unwrap().unwrap();
                seen.balance
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.update_balance(&id, 400).await.unwrap();
        first.commit().await.unwrap();

        // Second scope observes the committed value after acquiring the lock
        assert_eq!(contender.await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_currency_mismatch_and_unknown_account() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 1_000).unwrap();

        let mut tx = store.begin().await.unwrap();
        let usd = Currency::parse("USD").unwrap();
        assert!(tx.lock_account(&AccountId::new("a"), &usd).await.unwrap().is_none());
        assert!(
            tx.lock_account(&AccountId::new("ghost"), &idr())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_without_lock_and_negative_balance() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 10).unwrap();
        let id = AccountId::new("a");

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.update_balance(&id, 5).await,
            Err(TransferError::SystemError(_))
        ));

        tx.lock_account(&id, &idr()).await.unwrap();
        assert!(matches!(
            tx.update_balance(&id, -1).await,
            Err(TransferError::Database(_))
        ));
    }

    #[cfg(feature = "fault-injection")]
    #[tokio::test]
    async fn test_injected_commit_failure_discards_writes() {
        let store = MemoryStore::new();
        store.open_account("a", "user_A", "IDR", 1_000).unwrap();
        store.fail_next_commits(1);
        let id = AccountId::new("a");

        let mut tx = store.begin().await.unwrap();
        tx.lock_account(&id, &idr()).await.unwrap();
        tx.update_balance(&id, 1).await.unwrap();
        assert!(matches!(
            tx.commit().await,
            Err(TransferError::TransientStore(_))
        ));
        assert_eq!(store.balance("a"), Some(1_000));
    }

    #[tokio::test]
    async fn test_step_log_in_scope() {
        let store = MemoryStore::new();
        let saga_id = TransferId::new();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.record_step(saga_id, SagaStep::Debit, "{}").await.unwrap());
        assert!(!tx.record_step(saga_id, SagaStep::Debit, "{}").await.unwrap());
        assert!(tx.step_output(saga_id, SagaStep::Debit).await.unwrap().is_some());

        // Not visible outside until commit
        assert!(store.step_output(saga_id, SagaStep::Debit).await.unwrap().is_none());
        tx.commit().await.unwrap();
        assert!(store.step_output(saga_id, SagaStep::Debit).await.unwrap().is_some());
        assert!(!store.record_step(saga_id, SagaStep::Debit, "{}").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_transfer_rejected() {
        let store = MemoryStore::new();
        let params = TransferParams::new("a", "b", 5, "IDR", None).unwrap();
        let record = TransferRecord::new(TransferId::new(), &params, TransferStatus::Completed);

        let mut tx = store.begin().await.unwrap();
        tx.insert_transfer(&record).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.insert_transfer(&record).await,
            Err(TransferError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_saga_cas_and_stale_scan() {
        let store = MemoryStore::new();
        let params = TransferParams::new("a", "b", 5, "IDR", None).unwrap();
        let saga = SagaRecord::new(TransferId::new(), params);
        store.create_saga(&saga).await.unwrap();

        assert!(
            store
                .update_saga_state_if(saga.saga_id, SagaState::Created, SagaState::Debited, None)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_saga_state_if(
                    saga.saga_id,
                    SagaState::Created,
                    SagaState::Failed,
                    Some("late")
                )
                .await
                .unwrap()
        );

        let stale = store.find_stale_sagas(Duration::ZERO, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        let stale = store
            .find_stale_sagas(Duration::from_secs(3600), 10)
            .await
            .unwrap();
        assert!(stale.is_empty());
    }
}
