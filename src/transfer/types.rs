//! Transfer Core Types
//!
//! Identifiers, accounts, transfer records and the validated transfer input.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TransferError;
use super::state::SagaState;

/// Maximum memo length in characters
pub const MAX_MEMO_CHARS: usize = 1024;

/// Transfer ID - ULID-based unique identifier
///
/// Generated before any storage write, so the same value serves as the
/// transaction id, the saga instance id and the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Opaque account identifier
///
/// `Ord` provides the total order used for deadlock-free lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// ISO-4217 style currency code (three ASCII letters, upper-cased)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn parse(code: &str) -> Result<Self, TransferError> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(TransferError::Validation(format!(
                "currency must be a 3-letter code, got '{}'",
                code
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = TransferError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.0
    }
}

/// Account row. Balance is in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// Transaction status as exposed to callers and stored in `transfers_tb`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Reversed => "REVERSED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "COMPLETED" => Ok(TransferStatus::Completed),
            "FAILED" => Ok(TransferStatus::Failed),
            "REVERSED" => Ok(TransferStatus::Reversed),
            other => Err(TransferError::SystemError(format!(
                "Invalid transfer status: {}",
                other
            ))),
        }
    }
}

/// Validated transfer input (not persisted on its own)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub sender: AccountId,
    pub recipient: AccountId,
    pub amount: i64,
    pub currency: Currency,
    pub memo: Option<String>,
}

impl TransferParams {
    /// Build and validate transfer params from raw request values
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: i64,
        currency: &str,
        memo: Option<String>,
    ) -> Result<Self, TransferError> {
        let params = Self {
            sender: AccountId::new(sender),
            recipient: AccountId::new(recipient),
            amount,
            currency: Currency::parse(currency)?,
            memo,
        };
        params.validate()?;
        Ok(params)
    }

    /// Re-check invariants; called again by each path before touching storage
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.amount <= 0 {
            return Err(TransferError::Validation(
                "amount must be greater than zero".to_string(),
            ));
        }
        if self.sender.as_str().is_empty() || self.recipient.as_str().is_empty() {
            return Err(TransferError::Validation(
                "sender and recipient are required".to_string(),
            ));
        }
        if self.sender == self.recipient {
            return Err(TransferError::Validation(
                "sender and recipient must differ".to_string(),
            ));
        }
        if let Some(memo) = &self.memo
            && memo.chars().count() > MAX_MEMO_CHARS
        {
            return Err(TransferError::Validation(format!(
                "memo exceeds {} characters",
                MAX_MEMO_CHARS
            )));
        }
        Ok(())
    }
}

/// Immutable transaction record stored in `transfers_tb`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub sender: AccountId,
    pub recipient: AccountId,
    pub amount: i64,
    pub currency: Currency,
    pub status: TransferStatus,
    pub memo: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(id: TransferId, params: &TransferParams, status: TransferStatus) -> Self {
        Self {
            id,
            sender: params.sender.clone(),
            recipient: params.recipient.clone(),
            amount: params.amount,
            currency: params.currency.clone(),
            status,
            memo: params.memo.clone(),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} {} status={}",
            self.id, self.sender, self.recipient, self.amount, self.currency, self.status
        )
    }
}

/// Completion event announced on the message bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub transaction_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: TransferStatus,
}

impl From<&TransferRecord> for TransferEvent {
    fn from(record: &TransferRecord) -> Self {
        Self {
            transaction_id: record.id.to_string(),
            sender_id: record.sender.to_string(),
            recipient_id: record.recipient.to_string(),
            amount: record.amount,
            currency: record.currency.to_string(),
            status: record.status,
        }
    }
}

/// Persisted saga instance (`transfer_sagas_tb`)
#[derive(Debug, Clone)]
pub struct SagaRecord {
    /// Saga ID (equals the resulting transaction id)
    pub saga_id: TransferId,
    pub params: TransferParams,
    /// Current FSM state
    pub state: SagaState,
    /// Last error message (for debugging)
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Create a new saga record in CREATED state
    pub fn new(saga_id: TransferId, params: TransferParams) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            params,
            state: SagaState::Created,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Display for SagaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Saga[{}] {} -> {} amount={} {} state={}",
            self.saga_id,
            self.params.sender,
            self.params.recipient,
            self.params.amount,
            self.params.currency,
            self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parse() {
        assert_eq!(Currency::parse("idr").unwrap().as_str(), "IDR");
        assert_eq!(Currency::parse(" USD ").unwrap().as_str(), "USD");
        assert!(Currency::parse("RUPIAH").is_err());
        assert!(Currency::parse("U5D").is_err());
        assert!(Currency::parse("").is_err());
    }

    #[test]
    fn test_currency_deserialize_validates() {
        let ok: Currency = serde_json::from_str("\"eur\"").unwrap();
        assert_eq!(ok.as_str(), "EUR");
        assert!(serde_json::from_str::<Currency>("\"EURO\"").is_err());
    }

    #[test]
    fn test_params_validation() {
        assert!(TransferParams::new("a", "b", 100, "IDR", None).is_ok());

        let zero = TransferParams::new("a", "b", 0, "IDR", None);
        assert!(matches!(zero, Err(TransferError::Validation(_))));

        let negative = TransferParams::new("a", "b", -5, "IDR", None);
        assert!(matches!(negative, Err(TransferError::Validation(_))));

        let same = TransferParams::new("a", "a", 100, "IDR", None);
        assert!(matches!(same, Err(TransferError::Validation(_))));

        let long_memo = "x".repeat(MAX_MEMO_CHARS + 1);
        let memo = TransferParams::new("a", "b", 100, "IDR", Some(long_memo));
        assert!(matches!(memo, Err(TransferError::Validation(_))));

        let max_memo = "é".repeat(MAX_MEMO_CHARS);
        assert!(TransferParams::new("a", "b", 100, "IDR", Some(max_memo)).is_ok());
    }

    #[test]
    fn test_transfer_id_parse() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<TransferId>().is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TransferStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(
            "REVERSED".parse::<TransferStatus>().unwrap(),
            TransferStatus::Reversed
        );
        assert!("DONE".parse::<TransferStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&TransferStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }

    #[test]
    fn test_event_from_record() {
        let params = TransferParams::new("alice", "bob", 200_000, "IDR", None).unwrap();
        let record = TransferRecord::new(TransferId::new(), &params, TransferStatus::Completed);
        let event = TransferEvent::from(&record);

        assert_eq!(event.transaction_id, record.id.to_string());
        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.recipient_id, "bob");
        assert_eq!(event.amount, 200_000);
        assert_eq!(event.status, TransferStatus::Completed);
    }
}
