//! Ledger error types
//!
//! Two families matter to callers: validation errors (terminal, no side
//! effects) and checkpoint errors (terminal, but a checkpoint entry was
//! deliberately left behind and recovery has been signaled; do NOT
//! retry the operation, the log already owns the obligation).

use thiserror::Error;

use crate::models::TransferMethod;
use crate::recovery::ReloadTrigger;
use crate::stores::StoreError;

/// Errors returned by orchestrator operations.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Validation errors (no side effects) ===
    #[error("Amount is below the transaction base limit")]
    TransactionBaseLimit,

    #[error("Amount would exceed the rolling daily transaction cap")]
    DailyTransactionLimit,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Sender wallet not found")]
    SenderNotFound,

    #[error("Receiver wallet not found")]
    ReceiverNotFound,

    #[error("Transaction with own account is not allowed")]
    TransactionWithSelf,

    // === Token errors ===
    #[error("Money token not found or already redeemed")]
    TokenNotFound,

    #[error("Money token expired")]
    TokenExpired,

    #[error("Money token method mismatch: expected {expected}, got {actual}")]
    TokenMethodMismatch {
        expected: TransferMethod,
        actual: TransferMethod,
    },

    // === Checkpoint errors (recovery signaled, do not retry) ===
    #[error("Wallet mutation and its compensation both failed; checkpoint logged")]
    WalletCheckpoint,

    #[error("Money token step and its compensation both failed; checkpoint logged")]
    MoneyTokenCheckpoint,

    #[error("History append failed; checkpoint logged")]
    HistoryCheckpoint,

    // === Passthrough store failures (before any risky step) ===
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::TransactionBaseLimit => "TRANSACTION_BASE_LIMIT",
            LedgerError::DailyTransactionLimit => "DAILY_TRANSACTION_LIMIT",
            LedgerError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            LedgerError::SenderNotFound => "SENDER_NOT_FOUND",
            LedgerError::ReceiverNotFound => "RECEIVER_NOT_FOUND",
            LedgerError::TransactionWithSelf => "TRANSACTION_WITH_SELF",
            LedgerError::TokenNotFound => "TOKEN_NOT_FOUND",
            LedgerError::TokenExpired => "TOKEN_EXPIRED",
            LedgerError::TokenMethodMismatch { .. } => "TOKEN_METHOD_MISMATCH",
            LedgerError::WalletCheckpoint => "WALLET_CHECKPOINT",
            LedgerError::MoneyTokenCheckpoint => "MONEY_TOKEN_CHECKPOINT",
            LedgerError::HistoryCheckpoint => "HISTORY_CHECKPOINT",
            LedgerError::Store(_) => "STORE_ERROR",
        }
    }

    /// True for the errors that left a checkpoint entry behind.
    ///
    /// These should surface to users as "will settle automatically",
    /// not as a hard failure.
    #[inline]
    pub fn is_checkpoint(&self) -> bool {
        self.recovery_trigger().is_some()
    }

    /// The recovery trigger a checkpoint error maps to.
    pub fn recovery_trigger(&self) -> Option<ReloadTrigger> {
        match self {
            LedgerError::WalletCheckpoint => Some(ReloadTrigger::Wallet),
            LedgerError::MoneyTokenCheckpoint => Some(ReloadTrigger::MoneyToken),
            LedgerError::HistoryCheckpoint => Some(ReloadTrigger::History),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_classification() {
        assert!(LedgerError::WalletCheckpoint.is_checkpoint());
        assert!(LedgerError::MoneyTokenCheckpoint.is_checkpoint());
        assert!(LedgerError::HistoryCheckpoint.is_checkpoint());

        assert!(!LedgerError::InsufficientBalance.is_checkpoint());
        assert!(!LedgerError::TokenExpired.is_checkpoint());
        assert!(!LedgerError::Store(StoreError::Unavailable("down".into())).is_checkpoint());
    }

    #[test]
    fn test_trigger_mapping() {
        assert_eq!(
            LedgerError::WalletCheckpoint.recovery_trigger(),
            Some(ReloadTrigger::Wallet)
        );
        assert_eq!(
            LedgerError::MoneyTokenCheckpoint.recovery_trigger(),
            Some(ReloadTrigger::MoneyToken)
        );
        assert_eq!(
            LedgerError::HistoryCheckpoint.recovery_trigger(),
            Some(ReloadTrigger::History)
        );
        assert_eq!(LedgerError::SenderNotFound.recovery_trigger(), None);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(LedgerError::TransactionBaseLimit.code(), "TRANSACTION_BASE_LIMIT");
        assert_eq!(LedgerError::WalletCheckpoint.code(), "WALLET_CHECKPOINT");
    }
}
