//! Saga FSM State Definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.

use std::fmt;

use super::types::TransferStatus;

/// Transfer saga states
///
/// ```text
/// CREATED → DEBITED → CREDITED → COMPLETED
///    ↓         ↓          ↓
///  FAILED    FAILED     FAILED
///              ↓ (CompensationPolicy::Reverse)
///         COMPENSATING → REVERSED
/// ```
///
/// Terminal states: COMPLETED (40), FAILED (-10), REVERSED (-30)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SagaState {
    /// Params validated and recorded, nothing debited yet
    Created = 0,

    /// Sender debited - funds are IN-FLIGHT
    Debited = 10,

    /// Recipient credited and transaction record written
    Credited = 20,

    /// Terminal: completion event acknowledged by the bus
    Completed = 40,

    /// Terminal: unretriable error or retries exhausted
    Failed = -10,

    /// Reversal of the debit in progress
    Compensating = -20,

    /// Terminal: sender re-credited
    Reversed = -30,
}

impl SagaState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Reversed
        )
    }

    /// Check if funds are in-flight (debited, not yet credited or reversed)
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SagaState::Debited | SagaState::Compensating)
    }

    /// Cancellation is only safe before the debit commits
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SagaState::Created)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SagaState::Created),
            10 => Some(SagaState::Debited),
            20 => Some(SagaState::Credited),
            40 => Some(SagaState::Completed),
            -10 => Some(SagaState::Failed),
            -20 => Some(SagaState::Compensating),
            -30 => Some(SagaState::Reversed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Created => "CREATED",
            SagaState::Debited => "DEBITED",
            SagaState::Credited => "CREDITED",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Reversed => "REVERSED",
        }
    }

    /// Caller-visible transaction status for this saga state
    pub fn status(&self) -> TransferStatus {
        match self {
            SagaState::Created
            | SagaState::Debited
            | SagaState::Credited
            | SagaState::Compensating => TransferStatus::Pending,
            SagaState::Completed => TransferStatus::Completed,
            SagaState::Failed => TransferStatus::Failed,
            SagaState::Reversed => TransferStatus::Reversed,
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Saga step names, used as the second half of the step-log key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaStep {
    Debit,
    Credit,
    Publish,
    Reverse,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Debit => "DEBIT",
            SagaStep::Credit => "CREDIT",
            SagaStep::Publish => "PUBLISH",
            SagaStep::Reverse => "REVERSE",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
