//! Transfer API Layer
//!
//! Transport-neutral request handling: maps `CreateTransfer` /
//! `GetTransactionStatus` onto the direct path or the saga, and maps
//! [`TransferError`] onto caller-facing [`ApiStatus`] codes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::direct::DirectTransfer;
use super::error::{ApiStatus, TransferError};
use super::saga::TransferSaga;
use super::store::TransferStore;
use super::types::{TransferId, TransferParams, TransferRecord, TransferStatus};

// ============================================================================
// API Request/Response Types
// ============================================================================

/// Which path a create request takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One atomic storage transaction, answered synchronously
    #[default]
    Direct,
    /// Durable saga driven in the background
    Saga,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTransferRequest {
    pub sender_id: String,
    pub recipient_id: String,
    /// Minor units
    pub amount: i64,
    /// ISO-4217 style three-letter code
    pub currency: String,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateTransferResponse {
    pub transaction_id: String,
    pub status: TransferStatus,
    /// Present when the transfer finished synchronously
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransferRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStatusResponse {
    pub transaction_id: String,
    pub status: TransferStatus,
}

/// Caller-facing error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub status: ApiStatus,
    pub code: &'static str,
    pub message: String,
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self {
            status: e.api_status(),
            code: e.code(),
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct TransferService {
    mode: ExecutionMode,
    direct: DirectTransfer,
    saga: Arc<TransferSaga>,
}

impl TransferService {
    pub fn new(mode: ExecutionMode, direct: DirectTransfer, saga: Arc<TransferSaga>) -> Self {
        Self { mode, direct, saga }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn saga(&self) -> &Arc<TransferSaga> {
        &self.saga
    }

    pub async fn create_transfer(
        &self,
        req: CreateTransferRequest,
    ) -> Result<CreateTransferResponse, ApiError> {
        let params = TransferParams::new(
            req.sender_id,
            req.recipient_id,
            req.amount,
            &req.currency,
            req.memo,
        )?;

        match self.mode {
            ExecutionMode::Direct => {
                let record = self.direct.transfer(params).await?;
                Ok(CreateTransferResponse {
                    transaction_id: record.id.to_string(),
                    status: record.status,
                    transaction: Some(record),
                })
            }
            ExecutionMode::Saga => {
                let saga_id = self.saga.start(params).await?;

                let saga = self.saga.clone();
                tokio::spawn(async move {
                    match saga.execute(saga_id).await {
                        Ok(state) => {
                            debug!(transfer_id = %saga_id, state = %state, "Saga driver finished")
                        }
                        Err(e) => warn!(
                            transfer_id = %saga_id,
                            error = %e,
                            "Saga driver stopped, left for recovery"
                        ),
                    }
                });

                Ok(CreateTransferResponse {
                    transaction_id: saga_id.to_string(),
                    status: TransferStatus::Pending,
                    transaction: None,
                })
            }
        }
    }

    pub async fn get_transaction_status(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionStatusResponse, ApiError> {
        let id: TransferId = transaction_id
            .parse()
            .map_err(|_| TransferError::TransferNotFound(transaction_id.to_string()))?;
        let status = resolve_status(self.saga.store().as_ref(), id).await?;

        Ok(TransactionStatusResponse {
            transaction_id: id.to_string(),
            status,
        })
    }
}

/// A stored record wins; otherwise the saga state decides
async fn resolve_status(
    store: &dyn TransferStore,
    id: TransferId,
) -> Result<TransferStatus, TransferError> {
    if let Some(record) = store.get_transfer(id).await? {
        return Ok(record.status);
    }
    match store.get_saga(id).await? {
        Some(saga) => Ok(saga.state.status()),
        None => Err(TransferError::TransferNotFound(id.to_string())),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
