//! Storage seam for the transfer core
//!
//! [`TransferStore`] hands out [`LedgerTx`] transactional scopes and owns the
//! saga table plus the per-saga step log. Two engines implement it:
//! - [`PgStore`] - PostgreSQL, row locks via `SELECT ... FOR UPDATE`
//! - [`MemoryStore`] - single process, row locks via per-account async mutexes
//!
//! Dropping a `LedgerTx` without `commit` rolls it back and releases its locks.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;

use super::error::TransferError;
use super::state::{SagaState, SagaStep};
use super::types::{Account, AccountId, Currency, SagaRecord, TransferId, TransferRecord};

/// One transactional scope against the storage engine
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock the account row for the rest of this scope.
    /// Returns `None` when no account matches both id and currency.
    async fn lock_account(
        &mut self,
        id: &AccountId,
        currency: &Currency,
    ) -> Result<Option<Account>, TransferError>;

    /// Write a balance. The row must already be locked by this scope.
    async fn update_balance(&mut self, id: &AccountId, balance: i64) -> Result<(), TransferError>;

    /// Append a transaction record (ids are unique)
    async fn insert_transfer(&mut self, record: &TransferRecord) -> Result<(), TransferError>;

    /// Read a step-log entry as seen from inside this scope
    async fn step_output(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError>;

    /// Write a step-log entry atomically with the rest of this scope.
    /// Returns false if the entry already existed.
    async fn record_step(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError>;

    async fn commit(self: Box<Self>) -> Result<(), TransferError>;

    async fn rollback(self: Box<Self>) -> Result<(), TransferError>;
}

/// Storage handle passed explicitly into every component
#[async_trait]
pub trait TransferStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a new transactional scope
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, TransferError>;

    // === Non-locking reads ===

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, TransferError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError>;

    // === Saga table ===

    async fn create_saga(&self, saga: &SagaRecord) -> Result<(), TransferError>;

    async fn get_saga(&self, saga_id: TransferId) -> Result<Option<SagaRecord>, TransferError>;

    /// Atomic CAS: update state only if the current state matches `expected`.
    /// Returns false if another worker moved the saga first.
    async fn update_saga_state_if(
        &self,
        saga_id: TransferId,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&str>,
    ) -> Result<bool, TransferError>;

    async fn increment_saga_retry(&self, saga_id: TransferId) -> Result<(), TransferError>;

    /// Non-terminal sagas not updated within `threshold`, oldest first
    async fn find_stale_sagas(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError>;

    // === Step log outside any scope ===

    async fn step_output(
        &self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError>;

    /// Idempotent insert; returns false if the entry already existed
    async fn record_step(
        &self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError>;
}
