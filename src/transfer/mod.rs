//! Funds Transfer Core
//!
//! Moves value between two accounts and records the resulting transaction.
//!
//! # Paths
//!
//! - **Direct** ([`DirectTransfer`]): one storage transaction locks both
//!   accounts, moves the money and writes a COMPLETED record.
//! - **Saga** ([`TransferSaga`]): debit, credit and publish run as separate
//!   transactions behind a [`DurableExecutor`], each step idempotent per
//!   transfer id.
//!
//! # State Machine
//!
//! ```text
//! CREATED → DEBITED → CREDITED → COMPLETED
//!    ↓         ↓          ↓
//!  FAILED   FAILED     FAILED (event undelivered, money moved)
//!              ↓
//!        COMPENSATING → REVERSED        (CompensationPolicy::Reverse)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Lock Order**: accounts are always locked in ascending id order
//! 2. **Step Log**: a step's log row commits in the same transaction as its
//!    balance mutation, so re-running a step never applies it twice
//! 3. **CAS Transitions**: saga state only moves via compare-and-swap
//! 4. **Publish Never Undoes**: a failed event never rolls back moved money

pub mod api;
pub mod direct;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod publisher;
pub mod saga;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use api::{
    ApiError, CreateTransferRequest, CreateTransferResponse, ExecutionMode,
    TransactionStatusResponse, TransferService,
};
pub use direct::DirectTransfer;
pub use error::{ApiStatus, TransferError};
pub use executor::{DurableExecutor, RetryPolicy, StepLogExecutor, StepOutput};
pub use ledger::AccountLedger;
pub use publisher::{EventPublisher, RestProxyPublisher};
pub use saga::{CompensationPolicy, TransferSaga};
pub use state::{SagaState, SagaStep};
pub use store::{LedgerTx, MemoryStore, PgStore, TransferStore};
pub use types::{
    Account, AccountId, Currency, SagaRecord, TransferEvent, TransferId, TransferParams,
    TransferRecord, TransferStatus,
};
pub use worker::{RecoveryWorker, WorkerConfig};

#[cfg(any(test, feature = "fault-injection"))]
pub use publisher::RecordingPublisher;
