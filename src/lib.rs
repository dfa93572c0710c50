//! Funds Transfer - account-to-account money movement
//!
//! Moves value between two accounts, records the transaction and announces
//! completion on a message bus, atomically or recoverably under concurrent
//! transfers, partial failures and restarts.
//!
//! # Modules
//!
//! - [`transfer`] - Ledger, direct path, saga, executor, publisher, API facade
//! - [`config`] - YAML application config (`config/{env}.yaml`)
//! - [`logging`] - tracing subscriber with rolling file output
//! - [`db`] - PostgreSQL pool and row helpers

pub mod config;
pub mod db;
pub mod logging;
pub mod transfer;

// Convenient re-exports at crate root
pub use transfer::{
    AccountId, CompensationPolicy, Currency, DirectTransfer, ExecutionMode, MemoryStore, PgStore,
    RecoveryWorker, StepLogExecutor, TransferError, TransferId, TransferParams, TransferRecord,
    TransferSaga, TransferService, TransferStatus, TransferStore,
};
